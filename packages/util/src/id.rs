use sha2::{Digest, Sha256};

/// Number of hex chars kept from the digest.
const ACTOR_ID_LEN: usize = 16;

/// Derives the actor id for a `(name, key)` pair.
///
/// The id is the first 16 hex chars of `SHA-256(JSON([name, key]))`, so the
/// same pair always routes to the same actor without a lookup table.
pub fn actor_id_for_key(name: &str, key: &[String]) -> String {
	let payload = serde_json::json!([name, key]);
	let serialized = serde_json::to_vec(&payload).expect("json arrays always serialize");

	let digest = Sha256::digest(&serialized);

	let mut id = String::with_capacity(ACTOR_ID_LEN);
	for byte in digest.iter() {
		id.push_str(&format!("{byte:02x}"));
		if id.len() >= ACTOR_ID_LEN {
			break;
		}
	}
	id.truncate(ACTOR_ID_LEN);

	id
}

/// Validates that an id looks like one produced by [`actor_id_for_key`].
pub fn is_valid_actor_id(id: &str) -> bool {
	id.len() == ACTOR_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn id_is_deterministic() {
		let a = actor_id_for_key("counter", &["a".to_string()]);
		let b = actor_id_for_key("counter", &["a".to_string()]);
		assert_eq!(a, b);
		assert_eq!(a.len(), 16);
		assert!(is_valid_actor_id(&a));
	}

	#[test]
	fn id_differs_by_name_and_key() {
		let a = actor_id_for_key("counter", &["a".to_string()]);
		let b = actor_id_for_key("counter", &["b".to_string()]);
		let c = actor_id_for_key("gauge", &["a".to_string()]);
		assert_ne!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn key_tuple_is_not_flattened() {
		// ["ab"] and ["a", "b"] must hash differently.
		let a = actor_id_for_key("x", &["ab".to_string()]);
		let b = actor_id_for_key("x", &["a".to_string(), "b".to_string()]);
		assert_ne!(a, b);
	}
}

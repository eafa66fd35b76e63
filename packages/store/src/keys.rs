//! Key layout inside the per-actor KV database.
//!
//! The first byte namespaces the key: `0x00` is reserved for runtime-internal
//! records, `0x01` holds user data. User-facing operations only ever see the
//! bytes after the user prefix, and everything that lands in the database,
//! including migrated legacy entries, goes through this mapping.

pub const INTERNAL_PREFIX: u8 = 0x00;
pub const USER_PREFIX: u8 = 0x01;

const STATE_TAG: u8 = 0x00;
const HIBERNATION_TAG: u8 = 0x01;

/// Key for the mirrored user state document.
pub fn state_key() -> Vec<u8> {
	vec![INTERNAL_PREFIX, STATE_TAG]
}

/// Key for a persisted hibernatable connection, addressed by its gateway and
/// request identifiers.
pub fn hibernation_key(gateway_id: &[u8], request_id: &[u8]) -> Vec<u8> {
	let mut key = Vec::with_capacity(2 + 1 + gateway_id.len() + 1 + request_id.len());
	key.push(INTERNAL_PREFIX);
	key.push(HIBERNATION_TAG);
	key.push(gateway_id.len() as u8);
	key.extend_from_slice(gateway_id);
	key.push(request_id.len() as u8);
	key.extend_from_slice(request_id);
	key
}

/// Prefix covering every persisted hibernatable connection.
pub fn hibernation_prefix() -> Vec<u8> {
	vec![INTERNAL_PREFIX, HIBERNATION_TAG]
}

/// Maps a user key into its namespaced form.
pub fn user_key(key: &[u8]) -> Vec<u8> {
	let mut namespaced = Vec::with_capacity(1 + key.len());
	namespaced.push(USER_PREFIX);
	namespaced.extend_from_slice(key);
	namespaced
}

/// Strips the user namespace from a stored key.
pub fn strip_user_key(key: &[u8]) -> Option<&[u8]> {
	key.strip_prefix(&[USER_PREFIX])
}

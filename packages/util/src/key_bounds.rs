/// Computes the exclusive upper bound for a byte-prefix scan.
///
/// Increments the last byte that is not `0xFF` and truncates everything after
/// it. Returns `None` when the prefix is empty or all bytes are `0xFF`, in
/// which case the scan is unbounded above.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
	let idx = prefix.iter().rposition(|&b| b != 0xFF)?;

	let mut bound = prefix[..=idx].to_vec();
	bound[idx] += 1;

	Some(bound)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn increments_last_byte() {
		assert_eq!(prefix_upper_bound(b"abc"), Some(b"abd".to_vec()));
	}

	#[test]
	fn skips_trailing_ff() {
		assert_eq!(
			prefix_upper_bound(&[0x61, 0xFF, 0xFF]),
			Some(vec![0x62])
		);
	}

	#[test]
	fn unbounded_cases() {
		assert_eq!(prefix_upper_bound(&[]), None);
		assert_eq!(prefix_upper_bound(&[0xFF, 0xFF]), None);
	}

	#[test]
	fn bound_sorts_after_all_prefixed_keys() {
		let prefix = [0x61, 0xFF];
		let bound = prefix_upper_bound(&prefix).unwrap();
		let key = [0x61, 0xFF, 0x00, 0x07];
		assert!(key.as_slice() < bound.as_slice());
		assert!(prefix.as_slice() < bound.as_slice());
	}
}

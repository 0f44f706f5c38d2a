/// Computes the content identity of a raw input.
///
/// Inputs are immutable byte strings; the corpus, the crash store and the
/// wire protocol all refer to an input by this hash rather than by position,
/// so the same bytes discovered twice (or on two workers) collapse to one
/// identity.
pub fn content_id(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_stable_and_content_addressed() {
        let a = content_id(b"hello");
        let b = content_id(b"hello");
        let c = content_id(b"hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32, "md5 hex digest is 32 characters");
    }

    #[test]
    fn content_id_of_empty_input_is_defined() {
        assert_eq!(content_id(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}

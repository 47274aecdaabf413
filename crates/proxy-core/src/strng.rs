use arcstr::ArcStr;

/// Strng is a cheaply clonable, immutable string type. Cloning is a reference
/// count bump, so it can be passed around freely between tasks.
pub type Strng = ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

pub const EMPTY: Strng = literal!("");

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clones_share_storage() {
		let a = new("example.com");
		let b = a.clone();
		assert_eq!(a.as_ptr(), b.as_ptr());
		assert_eq!(a, "example.com");
	}
}

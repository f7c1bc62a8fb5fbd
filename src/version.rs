use std::fmt;

/// A protocol version number
///
/// `0` stands for "not applicable" and is never negotiated; the wire form of
/// a version is its four-byte tag (`Q036` for version 36).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VersionNumber(pub i32);

/// The versions this endpoint implements, in ascending order
pub const SUPPORTED_VERSIONS: [VersionNumber; 3] =
    [VersionNumber(34), VersionNumber(35), VersionNumber(36)];

impl VersionNumber {
    /// Maps version numbers ('36') to tags ('Q036')
    ///
    /// The tag is laid out so that writing it little-endian yields the ASCII
    /// bytes `Q`, hundreds, tens, ones.
    pub fn tag(self) -> u32 {
        let v = self.0 as u32;
        u32::from(b'Q')
            + ((v / 100 % 10 + u32::from(b'0')) << 8)
            + ((v / 10 % 10 + u32::from(b'0')) << 16)
            + ((v % 10 + u32::from(b'0')) << 24)
    }

    /// Inverse of [`tag`](Self::tag); garbage tags yield garbage numbers,
    /// which simply fail the supported-version check
    pub fn from_tag(tag: u32) -> Self {
        let digit = |shift: u32| ((tag >> shift) & 0xff).wrapping_sub(u32::from(b'0'));
        VersionNumber((digit(8) * 100 + digit(16) * 10 + digit(24)) as i32)
    }

    pub fn is_supported(self) -> bool {
        SUPPORTED_VERSIONS.contains(&self)
    }

    /// Whether this version frames packets with the IETF long/short headers
    /// rather than the legacy public header
    pub(crate) fn uses_ietf_header(self) -> bool {
        self.0 > 43
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Picks the highest version present in both `ours` and `theirs`
///
/// Neither list needs to be sorted.
pub(crate) fn highest_common_version(
    ours: &[VersionNumber],
    theirs: &[VersionNumber],
) -> Option<VersionNumber> {
    ours.iter()
        .filter(|v| theirs.contains(v))
        .max()
        .copied()
}

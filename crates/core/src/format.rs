use std::{fmt, num::NonZeroU32, str::FromStr};

/// Four-character code describing a pixel format.
///
/// # Example
/// ```rust
/// use obscura_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"RG24");
/// assert_eq!(fcc.to_string(), "RG24");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for FourCc {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Prefer string encoding so decoding does not rely on `deserialize_any`.
        let encoded = self.as_str().unwrap_or("FFFF");
        serializer.serialize_str(encoded)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for FourCc {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct FourCcVisitor;

        impl serde::de::Visitor<'_> for FourCcVisitor {
            type Value = FourCc;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 4-character FourCc string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                FourCc::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(FourCcVisitor)
    }
}

/// Bytes per pixel for packed single-plane formats, `None` for planar or
/// subsampled codes where the notion does not apply.
pub fn packed_bytes_per_pixel(code: FourCc) -> Option<usize> {
    match &code.to_u32().to_le_bytes() {
        b"GREY" => Some(1),
        b"YUYV" | b"UYVY" | b"RG16" => Some(2),
        b"RG24" | b"BG24" | b"RGB3" | b"BGR3" => Some(3),
        b"XR24" | b"XB24" | b"RGB0" | b"BGR0" | b"AB24" => Some(4),
        _ => None,
    }
}

/// Resolution of a frame.
///
/// # Example
/// ```rust
/// use obscura_core::prelude::Resolution;
///
/// let res = Resolution::new(640, 480).unwrap();
/// assert_eq!(res.width.get(), 640);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display_and_parse_round_trip() {
        let fcc: FourCc = "YUYV".parse().expect("parse");
        assert_eq!(fcc, FourCc::new(*b"YUYV"));
        assert_eq!(fcc.to_string(), "YUYV");
    }

    #[test]
    fn fourcc_rejects_wrong_length() {
        assert!("RGB".parse::<FourCc>().is_err());
        assert!("RGB24".parse::<FourCc>().is_err());
    }

    #[test]
    fn packed_depth_known_and_unknown() {
        assert_eq!(packed_bytes_per_pixel(FourCc::new(*b"RG24")), Some(3));
        assert_eq!(packed_bytes_per_pixel(FourCc::new(*b"GREY")), Some(1));
        assert_eq!(packed_bytes_per_pixel(FourCc::new(*b"NV12")), None);
    }

    #[test]
    fn resolution_rejects_zero() {
        assert!(Resolution::new(0, 480).is_none());
        assert!(Resolution::new(640, 0).is_none());
        assert!(Resolution::new(640, 480).is_some());
    }
}

use std::fmt;

/// Bluetooth Base UUID: 00000000-0000-1000-8000-00805F9B34FB, used to detect
/// whether a 128-bit UUID is really a shortened 16/32-bit assigned number.
const BASE_UUID_BYTES: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb,
];

#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Uuid {
    pub uu: [u8; 16],
}

impl Uuid {
    pub const ADV_128_BIT_LEN: usize = 16;
    pub const ADV_32_BIT_LEN: usize = 4;
    pub const ADV_16_BIT_LEN: usize = 2;

    pub fn empty() -> Uuid {
        Uuid { uu: [0; 16] }
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Uuid> {
        if raw.len() != 16 {
            return None;
        }
        let mut uu: [u8; 16] = [0; 16];
        uu.copy_from_slice(raw);
        Some(Uuid { uu })
    }

    /// Accepts 16, 32 or 128-bit hyphenated/plain hex forms and expands
    /// short forms against the Bluetooth base UUID.
    pub fn from_string<S: Into<String>>(raw: S) -> Option<Uuid> {
        let raw: String = raw.into();
        let s = raw.replace('-', "");
        let bytes = match s.len() {
            4 => hex_to_bytes(&s)?,
            8 => hex_to_bytes(&s)?,
            32 => hex_to_bytes(&s)?,
            _ => return None,
        };

        match bytes.len() {
            16 => Uuid::from_bytes(&bytes),
            4 => {
                let mut uu = BASE_UUID_BYTES;
                uu[2..4].copy_from_slice(&bytes[2..4]);
                // the first two octets carry the 16-bit short form
                uu[0] = bytes[0];
                uu[1] = bytes[1];
                Some(Uuid { uu })
            }
            2 => {
                let mut uu = BASE_UUID_BYTES;
                uu[2] = bytes[0];
                uu[3] = bytes[1];
                Some(Uuid { uu })
            }
            _ => None,
        }
    }

    fn is_base_uuid_suffix(&self) -> bool {
        self.uu[4..16] == BASE_UUID_BYTES[4..16]
    }

    /// Returns the shortest equivalent byte slice: 2, 4 or 16 bytes.
    pub fn get_shortest_slice(&self) -> &[u8] {
        if self.is_base_uuid_suffix() {
            if self.uu[0] == 0 && self.uu[1] == 0 {
                &self.uu[2..4]
            } else {
                &self.uu[0..4]
            }
        } else {
            &self.uu[..]
        }
    }
}

fn hex_to_bytes(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let u = self.uu;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u[0], u[1], u[2], u[3], u[4], u[5], u[6], u[7], u[8], u[9], u[10], u[11], u[12], u[13], u[14], u[15]
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Masks the non-assigned-number portion of a UUID for logging.
pub struct DisplayUuid<'a>(pub &'a Uuid);

impl<'a> fmt::Display for DisplayUuid<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.0.get_shortest_slice();
        if short.len() == self.0.uu.len() {
            write!(f, "{:02x}{:02x}...{:02x}{:02x}", short[0], short[1], short[14], short[15])
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_16_bit_against_base_uuid() {
        let u = Uuid::from_string("1800").unwrap();
        assert_eq!(u.get_shortest_slice(), &[0x18, 0x00]);
        assert_eq!(u.to_string(), "00001800-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn round_trips_128_bit() {
        let s = "12345678-1234-5678-1234-56789abcdef0";
        let u = Uuid::from_string(s).unwrap();
        assert_eq!(u.to_string(), s);
        assert_eq!(u.get_shortest_slice().len(), 16);
    }
}

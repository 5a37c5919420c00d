use core::fmt;

/// Lowercase hex rendering of a byte slice, used for correlation run ids and
/// for logging bodies that aren't valid UTF-8.
pub struct Hex<'a>(&'a [u8]);

impl<'a> Hex<'a> {
    fn new<T>(data: &'a T) -> Hex<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        Hex(data.as_ref())
    }
}

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> Hex<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> Hex<'_> {
        Hex::new(self)
    }
}

/// Renders a message body for logs: as text when it is UTF-8, as hex
/// otherwise.
pub(crate) fn body_display(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_owned(),
        Err(_) => format!("0x{}", body.hex()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_single_digit_bytes() {
        assert_eq!([0x0a_u8, 0xff, 0x00].hex().to_string(), "0aff00");
    }

    #[test]
    fn body_display_falls_back_to_hex() {
        assert_eq!(body_display(b"a=1"), "a=1");
        assert_eq!(body_display(&[0xff, 0xfe]), "0xfffe");
    }
}

//! Human-readable booking references and per-ticket codes.
//!
//! Generation only proposes candidates. Uniqueness is decided by the store;
//! the caller retries a bounded number of times on collision.

use core::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use boxoffice_core::DomainError;

/// Characters that survive being read aloud or printed: no `0/O`, `1/I/L`.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

const REFERENCE_PREFIX: &str = "BK-";
const REFERENCE_LEN: usize = 8;
const TICKET_PREFIX: &str = "TKT-";
const TICKET_LEN: usize = 10;

/// Booking reference shown to the buyer, e.g. `BK-7QK3M9TZ`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BookingReference(String);

/// Code printed on a single ticket, e.g. `TKT-A7C9XK2M4P`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketCode(String);

fn parse_code(s: &str, prefix: &str, len: usize, what: &str) -> Result<String, DomainError> {
    let body = s
        .strip_prefix(prefix)
        .ok_or_else(|| DomainError::validation(format!("invalid {what}: missing '{prefix}' prefix")))?;
    if body.len() != len || !body.bytes().all(|b| CODE_ALPHABET.contains(&b)) {
        return Err(DomainError::validation(format!(
            "invalid {what}: expected {len} characters from the code alphabet"
        )));
    }
    Ok(s.to_string())
}

macro_rules! impl_code {
    ($t:ident, $prefix:expr, $len:expr, $name:literal) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_code(s, $prefix, $len, $name).map(Self)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

impl_code!(BookingReference, REFERENCE_PREFIX, REFERENCE_LEN, "booking reference");
impl_code!(TicketCode, TICKET_PREFIX, TICKET_LEN, "ticket code");

/// Source of candidate codes.
pub trait CodeGenerator: Send + Sync {
    fn booking_reference(&self) -> BookingReference;

    fn ticket_code(&self) -> TicketCode;
}

impl<G> CodeGenerator for std::sync::Arc<G>
where
    G: CodeGenerator + ?Sized,
{
    fn booking_reference(&self) -> BookingReference {
        (**self).booking_reference()
    }

    fn ticket_code(&self) -> TicketCode {
        (**self).ticket_code()
    }
}

/// Draws codes from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeGenerator;

impl RandomCodeGenerator {
    fn body(len: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..len)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    }
}

impl CodeGenerator for RandomCodeGenerator {
    fn booking_reference(&self) -> BookingReference {
        BookingReference(format!("{REFERENCE_PREFIX}{}", Self::body(REFERENCE_LEN)))
    }

    fn ticket_code(&self) -> TicketCode {
        TicketCode(format!("{TICKET_PREFIX}{}", Self::body(TICKET_LEN)))
    }
}

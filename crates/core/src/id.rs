//! Ascending identifiers.
//!
//! Ids sort lexicographically in creation order within a process, which is
//! what gives messages and parts their document order.

use std::sync::Mutex;

/// The kinds of records that get identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Session,
    Message,
    Part,
    Permission,
    Call,
}

impl IdKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Session => "ses",
            Self::Message => "msg",
            Self::Part => "prt",
            Self::Permission => "per",
            Self::Call => "cal",
        }
    }
}

struct Clock {
    last_ms: i64,
    counter: u64,
}

static CLOCK: Mutex<Clock> = Mutex::new(Clock { last_ms: 0, counter: 0 });

/// Generate a new ascending identifier of the given kind.
pub fn ascending(kind: IdKind) -> String {
    let now = chrono::Utc::now().timestamp_millis();
    let value = {
        let mut clock = match CLOCK.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Never step backwards, even if the wall clock does.
        if now > clock.last_ms {
            clock.last_ms = now;
            clock.counter = 0;
        }
        if clock.counter >= 0xfff {
            clock.last_ms += 1;
            clock.counter = 0;
        }
        clock.counter += 1;
        (clock.last_ms as u64) * 0x1000 + clock.counter
    };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{:012x}{}", kind.prefix(), value, &suffix[..14])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix() {
        assert!(ascending(IdKind::Session).starts_with("ses_"));
        assert!(ascending(IdKind::Message).starts_with("msg_"));
        assert!(ascending(IdKind::Part).starts_with("prt_"));
    }

    #[test]
    fn ids_are_strictly_ascending() {
        let ids: Vec<String> = (0..500).map(|_| ascending(IdKind::Part)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }
}

//! Session protocol states, encoded as a bitmask so a session can be in
//! several "expect-next" states at once (e.g. RCPT stays legal after the
//! first RCPT while DATA becomes legal too).

use std::fmt;
use std::ops::BitOr;

/// A set of protocol states.
///
/// A command declares the mask it is permitted under; the session accepts it
/// iff the command has no mask or the masks intersect.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionState(u16);

impl SessionState {
    /// Initial state, greeting sent, nothing negotiated yet.
    pub const READY: Self = Self(1 << 0);
    /// Lines are message body, not commands.
    pub const MAIL_INPUT: Self = Self(1 << 1);
    /// Inside an AUTH exchange. Reserved; never entered in the current design.
    pub const AUTH: Self = Self(1 << 2);
    /// AUTH is legal (after HELO/EHLO).
    pub const EXPECT_AUTH: Self = Self(1 << 3);
    /// MAIL is legal (after HELO/EHLO or RSET).
    pub const EXPECT_MAIL: Self = Self(1 << 4);
    /// RCPT is legal (after MAIL).
    pub const EXPECT_RCPT: Self = Self(1 << 5);
    /// DATA is legal (after the first RCPT).
    pub const EXPECT_DATA: Self = Self(1 << 6);

    /// True iff any bit is shared between the two masks.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for SessionState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(SessionState, &str); 7] = [
            (SessionState::READY, "READY"),
            (SessionState::MAIL_INPUT, "MAIL_INPUT"),
            (SessionState::AUTH, "AUTH"),
            (SessionState::EXPECT_AUTH, "EXPECT_AUTH"),
            (SessionState::EXPECT_MAIL, "EXPECT_MAIL"),
            (SessionState::EXPECT_RCPT, "EXPECT_RCPT"),
            (SessionState::EXPECT_DATA, "EXPECT_DATA"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.intersects(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(empty)")?;
        }
        Ok(())
    }
}

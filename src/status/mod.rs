//! GnuPG status protocol
//!
//! gpg reports machine-readable progress on a dedicated descriptor
//! (`--status-fd`), one event per line:
//!
//! ```text
//! [GNUPG:] USERID_HINT 0123456789ABCDEF Alice <alice@example.org>
//! [GNUPG:] NEED_PASSPHRASE 0123456789ABCDEF 0123456789ABCDEF 1 0
//! [GNUPG:] GET_HIDDEN passphrase.enter
//! ```
//!
//! [`StatusParser`] turns a byte stream into [`StatusEvent`]s, tolerating
//! lines split across reads. Keywords are looked up in the closed
//! [`StatusKeyword`] vocabulary; anything newer than this crate knows about
//! is reported as [`StatusKeyword::Unexpected`] with the raw name preserved.
//!
//! ## Usage
//!
//! ```
//! use gpg_task::status::{StatusKeyword, StatusParser};
//!
//! let mut parser = StatusParser::new();
//! let mut events = parser.feed(b"[GNUPG:] NODATA 1\n[GNUPG:] BAD_PASS");
//! events.extend(parser.feed(b"PHRASE 0123456789ABCDEF\n"));
//!
//! assert_eq!(events.len(), 2);
//! assert_eq!(events[1].keyword, StatusKeyword::BadPassphrase);
//! assert_eq!(events[1].arg(0), Some("0123456789ABCDEF"));
//! ```

mod error_code;
mod escape;
mod keyword;
mod parser;

pub use error_code::ErrorCode;
pub use escape::{escape_value, unescape_value};
pub use keyword::StatusKeyword;
pub use parser::{STATUS_PREFIX, StatusEvent, StatusParser, parse_status_line};

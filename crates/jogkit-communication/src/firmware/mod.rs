//! Controller firmware protocols
//!
//! Only GRBL 1.1 is spoken: line commands acknowledged with `ok`/`error:n`,
//! `ALARM:n` notifications, `<...>` status reports and single-byte
//! real-time commands.

pub mod grbl;

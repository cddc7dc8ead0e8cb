#![forbid(unsafe_code)]
#![allow(clippy::needless_return)]
#![warn(clippy::await_holding_lock, clippy::inefficient_to_string)]

pub mod access;
pub mod actions;
pub mod constants;
pub mod doc_data;
pub mod records;
pub mod session;

pub use access::{AccessError, AccessOptions, GranularAccess};
pub use actions::{CellValue, DocAction, RowId, UserAction};
pub use doc_data::{DocData, RowSource, TableData, TableQuery};
pub use records::{RecordEditor, RecordView};
pub use session::{ActionGroup, Broadcaster, DocSession, DocUpdateMessage, Role};

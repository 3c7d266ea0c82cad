pub mod error;
pub mod sink;
pub mod types;

pub use error::{Error, Result};
pub use sink::{ChangeSink, ChannelSink, LogSink};
pub use types::{ChangeEvent, ChangeRecord, ColumnMeta, RowMap, TableRef, Value};

pub mod cache;

pub use cache::{HistoryCursor, HistoryPoint, WindowCache, decode_block};

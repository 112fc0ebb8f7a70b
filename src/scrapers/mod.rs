pub mod base;
pub mod tefas;
pub mod tradingview;
pub mod yahoo;
pub mod spreadsheet;

pub use base::InstrumentFetcher;
pub use spreadsheet::SpreadsheetFetcher;
pub use tefas::TefasFetcher;
pub use tradingview::TradingViewFetcher;
pub use yahoo::{YahooFetcher, YahooGroup};

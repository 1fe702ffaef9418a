pub mod collector;
pub mod rate_limit;

pub use collector::{CollectRequest, Collected, FetchedPage, PageWalk, PaginatedCollector};
pub use rate_limit::RequestPacer;

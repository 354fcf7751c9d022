pub mod engine;
pub mod fetcher;
pub mod planner;
pub mod timestamp;
pub mod watermark;

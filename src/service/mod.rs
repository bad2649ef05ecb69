pub mod backoff;
pub mod crawler;
pub mod extractor;
pub mod pipeline;
pub mod reconciler;
pub mod validator;

pub use backoff::{BackoffPolicy, PageRetry, RetryDecision};
pub use crawler::{CancelFlag, CrawlOutcome, CrawlPhase, DateCrawler};
pub use extractor::{extract_block, BlockContext};
pub use pipeline::{dates_between, DatePipeline, RangeRunner};
pub use reconciler::{OrderReconciler, Reconciliation};
pub use validator::Validator;

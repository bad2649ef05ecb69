pub mod check;
pub mod page;
pub mod report;
pub mod state;

pub use check::{CheckRecord, DiscountLine, FieldMismatch, LineItem, PaymentLine, ValidationOutcome};
pub use page::{
    DomBlock, DomTable, FetchedPage, NextPage, OrderAggregate, PaginationSummary, ServerDetails,
    SummaryCells,
};
pub use report::{
    CrawlSummary, DateReport, DateStatus, DateSummary, Evidence, OrderGroup, ReconciliationRow,
    ReconciliationStatus, RunSummary,
};
pub use state::{CrawlState, IncompleteReason, PageMerge, PassObservation, RetryEntry, StopRecord};

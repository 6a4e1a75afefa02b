#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::absolute_paths,
    clippy::arithmetic_side_effects,
    clippy::as_conversions,
    clippy::cast_possible_truncation, // u64 -> u32
    clippy::option_if_let_else,
    clippy::implicit_return,
    clippy::indexing_slicing,
    clippy::min_ident_chars,
    clippy::missing_assert_message,
    clippy::missing_errors_doc,
    clippy::missing_trait_methods,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::non_ascii_literal,
    clippy::pattern_type_mismatch,
    clippy::pub_use,
    clippy::question_mark_used,
    clippy::ref_patterns,
    clippy::self_named_module_files,
    clippy::shadow_reuse,
    clippy::shadow_unrelated,
    clippy::similar_names,
    clippy::single_call_fn,
    clippy::std_instead_of_alloc,
    clippy::std_instead_of_core,
    clippy::unseparated_literal_suffix,
    clippy::wildcard_enum_match_arm,
)]

pub mod checkpoint;
pub mod crawl;
pub mod ledger;
pub mod navigate;
pub mod record;
pub mod scrape;
pub mod sink;
pub mod table;
pub mod util;

pub use checkpoint::{CheckpointState, PointMarkStore, Position, ProgressStore};
pub use crawl::{
    CrawlConfig, CrawlSummary, Crawler, Interrupted, ItemExtractor, PageContext, PageNavigator,
    SessionLost, StopReason,
};
pub use ledger::DedupLedger;
pub use record::{KeySpec, Record, RecordIdentifier, SENTINEL};
pub use sink::RecordSink;

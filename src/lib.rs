//! Newswatch - keyword monitor for a members-only news site.
//!
//! Each run logs in, walks the paginated article listing, keeps entries whose
//! title or summary matches a keyword, drops the ones already reported,
//! translates titles, emails the rest, and saves a state snapshot for the
//! next run.

pub mod article;
pub mod config;
pub mod console;
mod cookies;
pub mod dedup;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod notifier;
pub mod orchestrator;
pub mod retry;
pub mod run_log;
pub mod session;
pub mod snapshot;
pub mod translator;
pub mod utils;

pub use article::{ArticleRecord, Candidate};
pub use config::Config;
pub use console::Console;
pub use dedup::{DedupState, DedupStore};
pub use error::{
    AuthError, ConfigError, DeliveryError, ExtractionError, FatalReason, FetchError, PersistError,
    TranslationError,
};
pub use extractor::{ArticleExtractor, PageExtraction};
pub use fetcher::{HttpTransport, PageResponse, SiteFetcher, Transport};
pub use notifier::{Message, NotificationBatcher, Notifier, SmtpNotifier};
pub use orchestrator::{Orchestrator, RunMode, Stage};
pub use retry::RetryPolicy;
pub use run_log::{RunLog, RunLogWriter, RunStats, RunStatus};
pub use session::{AnonymousAuthenticator, Authenticator, Session};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore, StateSnapshot};
pub use translator::{
    CachedTranslation, ChatTranslator, Translation, TranslationCache, TranslationState, Translator,
};

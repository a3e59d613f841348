//! caseflow-ledger
//!
//! Append-only status/amendment history with retry de-duplication, plus an
//! optional hash-chained JSONL journal for offline audit.

mod journal;
mod ledger;

pub use journal::{
    compute_record_hash, verify_journal, verify_journal_str, JournalRecord, LedgerJournal,
    VerifyResult,
};
pub use ledger::{
    is_duplicate_of, AmendmentRow, AppendOutcome, HistoryLedger, LedgerRow,
    DEFAULT_DEDUPE_WINDOW_MS,
};

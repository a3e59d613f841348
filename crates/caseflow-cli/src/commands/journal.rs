use anyhow::{bail, Result};
use caseflow_ledger::{verify_journal, VerifyResult};

pub fn verify(path: &str) -> Result<()> {
    match verify_journal(path)? {
        VerifyResult::Valid { records } => {
            println!("journal_valid=true records={records}");
            Ok(())
        }
        VerifyResult::Broken { line, reason } => {
            bail!("JOURNAL_BROKEN at line {line}: {reason}")
        }
    }
}

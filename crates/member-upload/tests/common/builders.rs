//! Builders for upload sheets and service configs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use member_upload::intake::luhn_check_digit;
use member_upload::UploadConfig;

/// A valid 13-digit identifier, distinct for every `seq` below 10 000.
/// Everyone is born on 1980-01-01.
pub fn id_number(seq: u32) -> String {
    let payload = format!("800101{:04}08", seq % 10_000);
    let check = luhn_check_digit(&payload).expect("payload is all digits");
    format!("{}{}", payload, check)
}

/// One data row of an upload sheet.
#[derive(Debug, Clone)]
pub struct MemberRow {
    pub id_number: String,
    pub first_name: String,
    pub surname: String,
    pub cell_number: String,
    pub ward_code: String,
    pub email: String,
}

impl MemberRow {
    pub fn valid(seq: u32) -> Self {
        Self {
            id_number: id_number(seq),
            first_name: format!("Member{}", seq),
            surname: "Dlamini".to_string(),
            cell_number: format!("082{:07}", seq),
            ward_code: "79700001".to_string(),
            email: String::new(),
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id_number = id.to_string();
        self
    }

    pub fn surname(mut self, surname: &str) -> Self {
        self.surname = surname.to_string();
        self
    }

    pub fn cell(mut self, cell: &str) -> Self {
        self.cell_number = cell.to_string();
        self
    }

    pub fn email(mut self, email: &str) -> Self {
        self.email = email.to_string();
        self
    }
}

/// Builds a CSV upload sheet.
#[derive(Debug, Clone, Default)]
pub struct SheetBuilder {
    rows: Vec<MemberRow>,
}

impl SheetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` valid rows with distinct identifiers, starting at `first_seq`.
    pub fn valid_rows(mut self, first_seq: u32, count: u32) -> Self {
        self.rows
            .extend((first_seq..first_seq + count).map(MemberRow::valid));
        self
    }

    pub fn row(mut self, row: MemberRow) -> Self {
        self.rows.push(row);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn to_csv(&self) -> String {
        let mut out =
            String::from("ID Number,First Name,Surname,Cell Number,Ward Code,Email\n");
        for r in &self.rows {
            out.push_str(&format!(
                "{},{},{},{},{},{}\n",
                r.id_number, r.first_name, r.surname, r.cell_number, r.ward_code, r.email
            ));
        }
        out
    }

    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.to_csv()).expect("Failed to write sheet");
        path
    }
}

/// Builder for `UploadConfig` with settings that keep tests fast: one
/// worker, a rate budget large enough to never bite, no automatic retries.
pub struct ConfigBuilder {
    config: UploadConfig,
}

impl ConfigBuilder {
    pub fn new(data_dir: &Path) -> Self {
        let mut config = UploadConfig::with_data_dir(data_dir);
        config.queue.worker_count = 1;
        config.queue.supervisor_interval_ms = 50;
        config.queue.retry_backoff_secs = 3600;
        config.verify.rate_limit = 10_000;
        config.verify.max_wait_secs = 1;
        config.verify.backoff_base_ms = 1;
        config.verify.parallelism = 2;
        Self { config }
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.config.queue.worker_count = count;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.persist.batch_size = size;
        self
    }

    pub fn rate_limit(mut self, limit: u32) -> Self {
        self.config.verify.rate_limit = limit;
        self
    }

    pub fn verification(mut self, enabled: bool) -> Self {
        self.config.verify.enabled = enabled;
        self
    }

    pub fn persist_not_found(mut self, persist: bool) -> Self {
        self.config.persist.persist_not_found = persist;
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.config.retention.retention_days = days;
        self
    }

    pub fn stall_timeout_secs(mut self, secs: u64) -> Self {
        self.config.queue.stall_timeout_secs = secs;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.queue.max_attempts = attempts;
        self
    }

    pub fn retry_backoff_secs(mut self, secs: u64) -> Self {
        self.config.queue.retry_backoff_secs = secs;
        self
    }

    pub fn watch_dir(mut self, dir: &Path) -> Self {
        self.config.watch.directory = Some(dir.to_path_buf());
        self.config.watch.poll_interval_secs = 1;
        self
    }

    pub fn build(self) -> UploadConfig {
        self.config
    }
}

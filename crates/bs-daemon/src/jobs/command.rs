//! Job body that delegates to an external scraper process.
//!
//! Protocol:
//! - environment: `BS_JOB_KEY`, `BS_HEADLESS` (`1`/`0`), `BS_WEBDRIVER_URL` when configured
//! - stdin: the credentials as one JSON object, then EOF
//! - stdout: `{"accounts": [...]}` or a bare array of accounts; an amount
//!   without `number` gets one parsed from its `raw` text
//! - exit status: `0` ok, `10` auth failure, `11` extraction failure,
//!   anything else is a session fault

use std::process::Stdio;

use async_trait::async_trait;
use bs_core::amount::parse_amount;
use bs_core::types::{AccountSnapshot, Amount};
use bs_core::vault::DecryptedCredentialSet;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::job::{JobBody, JobError, Session};

pub const EXIT_AUTH_FAILURE: i32 = 10;
pub const EXIT_EXTRACTION_FAILURE: i32 = 11;

const MAX_DETAIL_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct CommandJob {
    program: String,
    args: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScraperOutput {
    Wrapped { accounts: Vec<AccountSnapshot> },
    Bare(Vec<AccountSnapshot>),
}

impl CommandJob {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl JobBody for CommandJob {
    async fn run(
        &self,
        session: &Session,
        credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("BS_JOB_KEY", session.job_key())
            .env("BS_HEADLESS", if session.headless() { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(url) = session.webdriver_url() {
            cmd.env("BS_WEBDRIVER_URL", url);
        }

        let mut child = cmd.spawn().map_err(|e| {
            JobError::SessionFault(format!("failed to start `{}`: {e}", self.program))
        })?;
        tracing::debug!(job = session.job_key(), program = %self.program, pid = ?child.id(), "scraper started");

        if let Some(mut stdin) = child.stdin.take() {
            let payload = credentials.to_json();
            match stdin.write_all(payload.as_bytes()).await {
                Ok(()) => {}
                // The scraper may legitimately exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(JobError::SessionFault(format!(
                        "failed to hand credentials to scraper: {e}"
                    )))
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| JobError::SessionFault(format!("waiting for scraper: {e}")))?;
        let detail = last_line(&output.stderr);

        match output.status.code() {
            Some(0) => parse_accounts(&output.stdout),
            Some(EXIT_AUTH_FAILURE) => Err(JobError::AuthFailure(detail)),
            Some(EXIT_EXTRACTION_FAILURE) => Err(JobError::ExtractionFailure(detail)),
            _ => Err(JobError::SessionFault(format!(
                "scraper exited with {}: {detail}",
                output.status
            ))),
        }
    }
}

fn parse_accounts(stdout: &[u8]) -> Result<Vec<AccountSnapshot>, JobError> {
    match serde_json::from_slice::<ScraperOutput>(stdout) {
        Ok(ScraperOutput::Wrapped { mut accounts }) | Ok(ScraperOutput::Bare(mut accounts)) => {
            for account in &mut accounts {
                fill_number(&mut account.balance);
                fill_number(&mut account.available);
            }
            Ok(accounts)
        }
        Err(e) => Err(JobError::ExtractionFailure(format!(
            "scraper output is not an account list: {e}"
        ))),
    }
}

fn fill_number(amount: &mut Amount) {
    if amount.number.is_none() {
        amount.number = parse_amount(&amount.raw).number;
    }
}

/// Last non-empty stderr line, truncated.
fn last_line(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no diagnostic output");
    line.chars().take(MAX_DETAIL_CHARS).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::SessionPool;
    use bs_core::config::SessionConfig;

    const ACCOUNT: &str = r#"{"type":"credit","currency":"$","account_number":"ACC","balance":{"raw":"$ 10,00","number":10.0},"available":{"raw":"$ 5,00","number":5.0}}"#;

    fn sh(script: &str) -> CommandJob {
        CommandJob::new("sh", vec!["-c".into(), script.into()])
    }

    async fn run(job: &CommandJob) -> Result<Vec<AccountSnapshot>, JobError> {
        let pool = SessionPool::new(SessionConfig {
            webdriver_url: Some("http://selenium:4444".into()),
            headless: false,
        });
        let session = pool.acquire("oca").await.unwrap();
        let creds = DecryptedCredentialSet::from_pairs("oca", &[("password", "hunter2")]);
        job.run(&session, &creds).await
    }

    #[tokio::test]
    async fn wrapped_output_is_parsed() {
        let job = sh(&format!("cat >/dev/null; echo '{{\"accounts\":[{ACCOUNT}]}}'"));
        let accounts = run(&job).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].kind, "credit");
        assert_eq!(accounts[0].balance.number, Some(10.0));
    }

    #[tokio::test]
    async fn bare_array_and_environment() {
        let template = ACCOUNT.replace("ACC", "$BS_JOB_KEY-$BS_HEADLESS-$BS_WEBDRIVER_URL");
        let job = sh(&format!("cat >/dev/null; echo \"[{}]\"", template.replace('"', "\\\"")));
        let accounts = run(&job).await.unwrap();
        assert_eq!(accounts[0].account_number, "oca-0-http://selenium:4444");
    }

    #[tokio::test]
    async fn credentials_arrive_on_stdin() {
        let job = sh(r#"input=$(cat); case "$input" in *hunter2*) echo '[]' ;; *) exit 11 ;; esac"#);
        assert!(run(&job).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exit_codes_are_classified() {
        let auth = run(&sh("echo 'login rejected' >&2; exit 10")).await.unwrap_err();
        assert!(matches!(auth, JobError::AuthFailure(ref m) if m == "login rejected"));

        let extraction = run(&sh("exit 11")).await.unwrap_err();
        assert!(matches!(extraction, JobError::ExtractionFailure(_)));

        let crash = run(&sh("exit 3")).await.unwrap_err();
        assert!(matches!(crash, JobError::SessionFault(_)));
    }

    #[tokio::test]
    async fn garbage_output_is_extraction_failure() {
        let err = run(&sh("echo '<html>'")).await.unwrap_err();
        assert!(matches!(err, JobError::ExtractionFailure(_)));
    }

    #[tokio::test]
    async fn missing_program_is_session_fault() {
        let job = CommandJob::new("/nonexistent/scraper", Vec::new());
        assert!(matches!(run(&job).await.unwrap_err(), JobError::SessionFault(_)));
    }

    #[test]
    fn missing_number_is_parsed_from_raw() {
        let out = br#"[{"type":"savings","currency":"U$S","account_number":"1",
            "balance":{"raw":"U$S 1.234,56"},
            "available":{"raw":"-","number":null}}]"#;
        let accounts = parse_accounts(out).unwrap();
        assert_eq!(accounts[0].balance.number, Some(1234.56));
        assert_eq!(accounts[0].balance.raw, "U$S 1.234,56");
        assert_eq!(accounts[0].available.number, None);

        let given = parse_accounts(format!("[{ACCOUNT}]").as_bytes()).unwrap();
        assert_eq!(given[0].available.number, Some(5.0));
    }

    #[test]
    fn last_line_skips_blank_lines() {
        assert_eq!(last_line(b"first\nsecond\n\n"), "second");
        assert_eq!(last_line(b""), "no diagnostic output");
    }
}

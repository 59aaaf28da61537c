//! Cursor-based incremental key scan.
//!
//! A page is gathered from repeated `SCAN` rounds until the requested number
//! of keys is reached. When a round returns more keys than fit, the page
//! cursor points back at that round's server cursor together with the
//! number of keys already consumed from it, so the next page neither skips
//! nor repeats keys.
//!
//! Cursor tokens have the form `"<server_cursor>:<skip>"`. Both `""` and
//! `"0"` start a new scan.

use async_trait::async_trait;
use std::fmt;

use crate::error::{QuarryError, QuarryResult};

/// Keys requested from the server per round.
///
/// Fixed so that resuming a round with the same server cursor reproduces the
/// same batch regardless of the caller's page size.
pub const SCAN_BATCH: usize = 500;

/// Upper bound on rounds in a single page request.
pub const MAX_SCAN_ROUNDS: usize = 1_000;

/// One `SCAN cursor MATCH pattern COUNT count` round trip.
#[async_trait]
pub trait KeyScanner: Send {
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> QuarryResult<(u64, Vec<String>)>;
}

/// Position inside a scan: server cursor plus keys already taken from the
/// batch that cursor yields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCursor {
    pub server: u64,
    pub skip: usize,
}

impl ScanCursor {
    pub fn parse(token: &str) -> QuarryResult<Self> {
        let token = token.trim();
        if token.is_empty() || token == "0" {
            return Ok(Self::default());
        }
        let invalid = || QuarryError::validation(format!("Invalid scan cursor: {token}"));
        match token.split_once(':') {
            Some((server, skip)) => Ok(Self {
                server: server.parse().map_err(|_| invalid())?,
                skip: skip.parse().map_err(|_| invalid())?,
            }),
            None => Ok(Self { server: token.parse().map_err(|_| invalid())?, skip: 0 }),
        }
    }

    pub fn is_start(&self) -> bool {
        self.server == 0 && self.skip == 0
    }
}

impl fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_start() {
            f.write_str("0")
        } else {
            write!(f, "{}:{}", self.server, self.skip)
        }
    }
}

/// Keys of one page and where to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    pub cursor: ScanCursor,
    pub complete: bool,
}

/// Gather up to `limit` keys matching `pattern`, starting at `cursor`.
pub async fn collect_page<S>(
    scanner: &mut S,
    pattern: &str,
    limit: usize,
    cursor: &str,
) -> QuarryResult<ScanPage>
where
    S: KeyScanner + ?Sized,
{
    let start = ScanCursor::parse(cursor)?;
    let limit = limit.max(1);
    let mut keys = Vec::with_capacity(limit.min(SCAN_BATCH));
    let mut server = start.server;
    let mut skip = start.skip;

    for _ in 0..MAX_SCAN_ROUNDS {
        let (next, batch) = scanner.scan(server, pattern, SCAN_BATCH).await?;
        let remaining: Vec<String> = batch.into_iter().skip(skip).collect();
        let room = limit - keys.len();

        if remaining.len() > room {
            keys.extend(remaining.into_iter().take(room));
            let cursor = ScanCursor { server, skip: skip + room };
            return Ok(ScanPage { keys, cursor, complete: false });
        }

        keys.extend(remaining);
        skip = 0;
        server = next;

        if server == 0 {
            return Ok(ScanPage { keys, cursor: ScanCursor::default(), complete: true });
        }
        if keys.len() == limit {
            break;
        }
    }

    tracing::debug!(
        keys = keys.len(),
        server_cursor = server,
        "Scan page ended before keyspace end"
    );
    Ok(ScanPage { keys, cursor: ScanCursor { server, skip: 0 }, complete: false })
}

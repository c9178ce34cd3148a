use crate::error::{DtsError, Result};
use chrono::{Timelike, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

static ORCID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{4}-\d{4}-\d{3}[\dX]$").unwrap());
static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// True iff the string is a well-formed ORCID identifier
pub fn is_orcid(s: &str) -> bool {
    ORCID_RE.is_match(s)
}

enum FederationRequest {
    Lookup {
        orcid: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Reload {
        reply: oneshot::Sender<Result<usize>>,
    },
}

/// Handle to the ORCID → local-username mapping for one database.
///
/// The mapping is owned by a dedicated task and reached only through a
/// request channel; the map itself is never shared. It is reloaded from its
/// CSV file at the top of every hour. A reload that fails validation keeps
/// the previously loaded map.
#[derive(Clone)]
pub struct UserFederation {
    tx: mpsc::Sender<FederationRequest>,
}

impl UserFederation {
    /// Load the users file and spawn the owning task. The initial load must
    /// succeed; later reload failures only log.
    pub fn spawn(path: PathBuf) -> Result<Self> {
        let users = load_users_file(&path)?;
        info!(
            "User federation loaded {} mappings from {}",
            users.len(),
            path.display()
        );

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(federation_loop(path, users, rx));

        Ok(Self { tx })
    }

    /// Resolve an ORCID to a local username, if one is mapped
    pub async fn local_user(&self, orcid: &str) -> Result<Option<String>> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(FederationRequest::Lookup {
                orcid: orcid.to_string(),
                reply,
            })
            .await
            .map_err(|_| DtsError::Federation("federation task has stopped".into()))?;
        response
            .await
            .map_err(|_| DtsError::Federation("federation task dropped the request".into()))
    }

    /// Force an immediate reload, returning the new mapping count
    pub async fn reload(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(FederationRequest::Reload { reply })
            .await
            .map_err(|_| DtsError::Federation("federation task has stopped".into()))?;
        response
            .await
            .map_err(|_| DtsError::Federation("federation task dropped the request".into()))?
    }
}

async fn federation_loop(
    path: PathBuf,
    mut users: HashMap<String, String>,
    mut rx: mpsc::Receiver<FederationRequest>,
) {
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else {
                    debug!("All federation handles dropped; stopping");
                    return;
                };
                match request {
                    FederationRequest::Lookup { orcid, reply } => {
                        let _ = reply.send(users.get(&orcid).cloned());
                    }
                    FederationRequest::Reload { reply } => {
                        let _ = reply.send(reload(&path, &mut users));
                    }
                }
            }
            _ = tokio::time::sleep(until_next_hour()) => {
                if let Err(e) = reload(&path, &mut users) {
                    warn!("Scheduled user federation reload failed: {}", e);
                }
            }
        }
    }
}

fn reload(path: &Path, users: &mut HashMap<String, String>) -> Result<usize> {
    match load_users_file(path) {
        Ok(fresh) => {
            let count = fresh.len();
            *users = fresh;
            info!("User federation reloaded {} mappings", count);
            Ok(count)
        }
        Err(e) => {
            warn!(
                "User federation reload from {} failed, keeping {} previous mappings: {}",
                path.display(),
                users.len(),
                e
            );
            Err(e)
        }
    }
}

/// Time remaining until the top of the next hour. The reload fires on the
/// hour boundary regardless of when the service started.
fn until_next_hour() -> Duration {
    let now = Utc::now();
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    Duration::from_secs(3600 - into_hour.min(3599))
}

fn load_users_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        DtsError::Federation(format!("cannot read users file {}: {e}", path.display()))
    })?;
    parse_users_csv(&contents)
}

/// Parse a two-column ORCID/username CSV. The column order is detected per
/// row by validating one field as an ORCID and the other as a username;
/// comment lines (`#`) and rows matching neither orientation are skipped.
/// The result must be a 1:1 mapping or the whole parse fails.
fn parse_users_csv(contents: &str) -> Result<HashMap<String, String>> {
    let mut forward: HashMap<String, String> = HashMap::new();
    let mut reverse: HashMap<String, String> = HashMap::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.splitn(2, ',');
        let (Some(first), Some(second)) = (fields.next(), fields.next()) else {
            debug!("Skipping users row {} with a single column", lineno + 1);
            continue;
        };
        let (first, second) = (first.trim(), second.trim());

        let (orcid, username) = if is_orcid(first) && USERNAME_RE.is_match(second) {
            (first, second)
        } else if is_orcid(second) && USERNAME_RE.is_match(first) {
            (second, first)
        } else {
            debug!("Skipping unrecognized users row {}", lineno + 1);
            continue;
        };

        if let Some(existing) = forward.get(orcid) {
            if existing != username {
                return Err(DtsError::Federation(format!(
                    "ORCID {orcid} maps to both '{existing}' and '{username}'"
                )));
            }
        }
        if let Some(existing) = reverse.get(username) {
            if existing != orcid {
                return Err(DtsError::Federation(format!(
                    "username '{username}' maps to both {existing} and {orcid}"
                )));
            }
        }

        forward.insert(orcid.to_string(), username.to_string());
        reverse.insert(username.to_string(), orcid.to_string());
    }

    Ok(forward)
}

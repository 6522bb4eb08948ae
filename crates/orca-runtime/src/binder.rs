use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use orca_core::Result;

use crate::engine::Engine;

const HANDLE_PREFIX: &str = "conv_";
const HANDLE_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const HANDLE_SUFFIX_LEN: usize = 10;

/// A caller-facing handle and the internal session it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub external: String,
    pub internal: String,
    /// True when this resolve created the binding.
    pub created: bool,
}

/// Maps external conversation handles to internal session ids.
///
/// Every read and write goes through one lock, which is also held while a
/// new session is created, so two first contacts for the same handle can
/// never produce two sessions. Bindings are never changed once made.
#[derive(Default)]
pub struct IdentityBinder {
    table: Mutex<HashMap<String, String>>,
}

impl IdentityBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `handle` to its session and make that session active on `engine`.
    ///
    /// An absent or blank handle gets a freshly minted one. A handle seen for
    /// the first time is bound, in order of preference, to the stored
    /// conversation it names, to the engine's active session while nothing is
    /// bound to it yet, or to a new session.
    pub async fn resolve(&self, engine: &Engine, handle: Option<&str>) -> Result<Binding> {
        let mut table = self.table.lock().await;

        let external = match handle.map(str::trim).filter(|h| !h.is_empty()) {
            Some(h) => h.to_string(),
            None => loop {
                let minted = mint_handle();
                if !table.contains_key(&minted) {
                    break minted;
                }
            },
        };

        if let Some(internal) = table.get(&external).cloned() {
            engine.set_conversation_id(&internal)?;
            debug!(%external, %internal, "resolved existing binding");
            return Ok(Binding {
                external,
                internal,
                created: false,
            });
        }

        let internal = match engine.memory().get_conversation(&external).await {
            Ok(stored) => {
                debug!(%external, "handle names a stored conversation, resuming it");
                stored.id
            }
            Err(e) if e.is_not_found() => {
                let active = engine.get_conversation_id();
                if !active.is_empty() && !table.values().any(|bound| *bound == active) {
                    debug!(%external, session = %active, "adopting the unbound active session");
                    active
                } else {
                    engine.new_conversation().await?
                }
            }
            Err(e) => return Err(e),
        };
        engine.set_conversation_id(&internal)?;
        table.insert(external.clone(), internal.clone());
        info!(%external, %internal, "bound new conversation handle");
        Ok(Binding {
            external,
            internal,
            created: true,
        })
    }

    /// The session bound to `external`, without creating anything.
    pub async fn lookup(&self, external: &str) -> Option<String> {
        self.table.lock().await.get(external).cloned()
    }

    /// The handle shown for each bound session. When several handles share a
    /// session the smallest one is reported, so listings are stable.
    pub async fn handles_by_session(&self) -> HashMap<String, String> {
        let table = self.table.lock().await;
        let mut handles: HashMap<String, String> = HashMap::new();
        for (external, internal) in table.iter() {
            handles
                .entry(internal.clone())
                .and_modify(|shown| {
                    if external < shown {
                        *shown = external.clone();
                    }
                })
                .or_insert_with(|| external.clone());
        }
        handles
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }
}

/// `conv_` followed by ten random alphanumerics.
pub fn mint_handle() -> String {
    let suffix: String = (0..HANDLE_SUFFIX_LEN)
        .map(|_| HANDLE_CHARSET[rand::random::<u32>() as usize % HANDLE_CHARSET.len()] as char)
        .collect();
    format!("{HANDLE_PREFIX}{suffix}")
}

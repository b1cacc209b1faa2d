//! Cookie-backed identity cache.
//!
//! A tracking cookie carries a random ID only; everything attached to it
//! (creation time, authentication info, the live connections presenting it)
//! lives in the store. The file-backed store persists records append-only
//! and replays them at startup, so an authenticated identity survives a
//! router restart.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::settings::Cookie as CookieConfig;
use crate::types::{ConnectionId, HashMap, HashSet};
use crate::utils;
use crate::Result;

/// Authentication info attached to a cookie once its bearer has
/// authenticated: `(authid, authrole, authmethod)`.
pub type CookieAuth = (Option<String>, Option<String>, Option<String>);

#[derive(Debug, Clone, Default)]
struct CookieData {
    created: String,
    max_age: u64,
    authid: Option<String>,
    authrole: Option<String>,
    authmethod: Option<String>,
    connections: HashSet<ConnectionId>,
}

/// One line of the cookie persistence file.
#[derive(Debug, Serialize, Deserialize)]
struct CookieRecord {
    id: String,
    created: String,
    max_age: u64,
    authid: Option<String>,
    authrole: Option<String>,
    authmethod: Option<String>,
}

/// Memory-backed cookie store.
pub struct MemoryCookieStore {
    cfg: CookieConfig,
    cookies: RwLock<HashMap<String, CookieData>>,
}

impl MemoryCookieStore {
    pub fn new(cfg: CookieConfig) -> Self {
        Self { cfg, cookies: RwLock::new(HashMap::default()) }
    }

    /// Extract the cookie ID from a raw `Cookie` header value. Returns the
    /// ID only if the header carries our cookie name AND the ID is known to
    /// the store.
    pub fn parse(&self, header: &str) -> Option<String> {
        for part in header.split(';') {
            if let Some((name, value)) = part.trim().split_once('=') {
                if name.trim() == self.cfg.name {
                    let id = value.trim();
                    if self.cookies.read().contains_key(id) {
                        return Some(id.to_owned());
                    }
                }
            }
        }
        None
    }

    /// Mint a new cookie, returning the ID and the `Set-Cookie` header
    /// value. The header never carries the `secure` attribute: it refers to
    /// the scheme of the page that opened the connection, not to the
    /// connection itself.
    pub fn create(&self) -> (String, String) {
        let id = utils::newid(self.cfg.length);
        let data = CookieData {
            created: utils::utcnow(),
            max_age: self.cfg.max_age,
            ..Default::default()
        };
        let header = format!("{}={};max-age={}", self.cfg.name, id, data.max_age);
        self.cookies.write().insert(id.clone(), data);
        log::debug!("new cookie {} created", id);
        (id, header)
    }

    #[inline]
    pub fn exists(&self, id: &str) -> bool {
        self.cookies.read().contains_key(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cookies.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cookies.read().is_empty()
    }

    pub fn get_auth(&self, id: &str) -> CookieAuth {
        match self.cookies.read().get(id) {
            Some(c) => (c.authid.clone(), c.authrole.clone(), c.authmethod.clone()),
            None => (None, None, None),
        }
    }

    /// Attach authentication info to a cookie. Returns true if the stored
    /// info actually changed (unknown IDs and no-op updates return false).
    pub fn set_auth(&self, id: &str, authid: &str, authrole: &str, authmethod: &str) -> bool {
        let mut cookies = self.cookies.write();
        match cookies.get_mut(id) {
            Some(c) => {
                let changed = c.authid.as_deref() != Some(authid)
                    || c.authrole.as_deref() != Some(authrole)
                    || c.authmethod.as_deref() != Some(authmethod);
                if changed {
                    c.authid = Some(authid.to_owned());
                    c.authrole = Some(authrole.to_owned());
                    c.authmethod = Some(authmethod.to_owned());
                }
                changed
            }
            None => false,
        }
    }

    /// Track a connection presenting this cookie; returns the live count.
    pub fn add_conn(&self, id: &str, conn: ConnectionId) -> usize {
        let mut cookies = self.cookies.write();
        match cookies.get_mut(id) {
            Some(c) => {
                c.connections.insert(conn);
                c.connections.len()
            }
            None => 0,
        }
    }

    /// Untrack a connection; returns the remaining live count.
    pub fn drop_conn(&self, id: &str, conn: ConnectionId) -> usize {
        let mut cookies = self.cookies.write();
        match cookies.get_mut(id) {
            Some(c) => {
                c.connections.remove(&conn);
                c.connections.len()
            }
            None => 0,
        }
    }

    fn insert_replayed(&self, record: CookieRecord) {
        // last record per ID wins; connections are never persisted
        self.cookies.write().insert(
            record.id,
            CookieData {
                created: record.created,
                max_age: record.max_age,
                authid: record.authid,
                authrole: record.authrole,
                authmethod: record.authmethod,
                connections: HashSet::default(),
            },
        );
    }
}

/// File-backed cookie store. Records are appended as JSON lines, one per
/// create or auth change; startup replays the file sequentially, the last
/// record per cookie ID winning.
pub struct FileCookieStore {
    inner: MemoryCookieStore,
    path: PathBuf,
    file: Mutex<File>,
}

impl FileCookieStore {
    pub fn open<P: AsRef<Path>>(path: P, cfg: CookieConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let purge_on_startup = cfg.purge_on_startup;
        let inner = MemoryCookieStore::new(cfg);

        let mut replayed = 0usize;
        if path.is_file() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: CookieRecord = serde_json::from_str(&line)?;
                inner.insert_replayed(record);
                replayed += 1;
            }
        }
        log::info!(
            "loaded {} cookie record(s) from {:?}, cookie store has {} entries",
            replayed,
            path,
            inner.len()
        );

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let store = Self { inner, path, file: Mutex::new(file) };
        if purge_on_startup {
            store.purge()?;
        }
        Ok(store)
    }

    fn persist(&self, id: &str) -> Result<()> {
        let record = {
            let cookies = self.inner.cookies.read();
            let c = cookies.get(id).ok_or_else(|| anyhow::anyhow!("unknown cookie {:?}", id))?;
            CookieRecord {
                id: id.to_owned(),
                created: c.created.clone(),
                max_age: c.max_age,
                authid: c.authid.clone(),
                authrole: c.authrole.clone(),
                authmethod: c.authmethod.clone(),
            }
        };
        let mut file = self.file.lock();
        serde_json::to_writer(&mut *file, &record)?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite the persistence file, dropping expired cookies from the file
    /// and the in-memory map.
    pub fn purge(&self) -> Result<()> {
        let now = Utc::now();
        let mut cookies = self.inner.cookies.write();
        cookies.retain(|_, c| match DateTime::parse_from_rfc3339(&c.created) {
            Ok(created) => created.with_timezone(&Utc) + Duration::seconds(c.max_age as i64) > now,
            Err(_) => false,
        });

        let mut file = self.file.lock();
        let mut fresh = File::create(&self.path)?;
        for (id, c) in cookies.iter() {
            let record = CookieRecord {
                id: id.clone(),
                created: c.created.clone(),
                max_age: c.max_age,
                authid: c.authid.clone(),
                authrole: c.authrole.clone(),
                authmethod: c.authmethod.clone(),
            };
            serde_json::to_writer(&mut fresh, &record)?;
            fresh.write_all(b"\n")?;
        }
        fresh.flush()?;
        fresh.sync_all()?;
        *file = OpenOptions::new().append(true).open(&self.path)?;
        log::info!("cookie file compacted, {} entries kept", cookies.len());
        Ok(())
    }

    #[inline]
    pub fn parse(&self, header: &str) -> Option<String> {
        self.inner.parse(header)
    }

    pub fn create(&self) -> Result<(String, String)> {
        let (id, header) = self.inner.create();
        self.persist(&id)?;
        Ok((id, header))
    }

    #[inline]
    pub fn exists(&self, id: &str) -> bool {
        self.inner.exists(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn get_auth(&self, id: &str) -> CookieAuth {
        self.inner.get_auth(id)
    }

    /// Attach authentication info; a record is appended only when the info
    /// actually changed.
    pub fn set_auth(&self, id: &str, authid: &str, authrole: &str, authmethod: &str) -> Result<bool> {
        let changed = self.inner.set_auth(id, authid, authrole, authmethod);
        if changed {
            self.persist(id)?;
        }
        Ok(changed)
    }

    #[inline]
    pub fn add_conn(&self, id: &str, conn: ConnectionId) -> usize {
        self.inner.add_conn(id, conn)
    }

    #[inline]
    pub fn drop_conn(&self, id: &str, conn: ConnectionId) -> usize {
        self.inner.drop_conn(id, conn)
    }
}

use std::sync::{Arc, OnceLock};

use ring::digest::{SHA1_FOR_LEGACY_USE_ONLY, digest};
use serde::Serialize;

const ACQUIRE_SCRIPT: &str = r#"
for _, key in ipairs(KEYS) do
  if redis.call("exists", key) == 1 then
    return 0
  end
end

for _, key in ipairs(KEYS) do
  redis.call("set", key, ARGV[1], "PX", ARGV[2])
end

return #KEYS
"#;

const EXTEND_SCRIPT: &str = r#"
for _, key in ipairs(KEYS) do
  if redis.call("get", key) ~= ARGV[1] then
    return 0
  end
end

for _, key in ipairs(KEYS) do
  redis.call("set", key, ARGV[1], "PX", ARGV[2])
end

return #KEYS
"#;

const RELEASE_SCRIPT: &str = r#"
local count = 0
for _, key in ipairs(KEYS) do
  if redis.call("get", key) == ARGV[1] then
    count = count + redis.call("del", key)
  end
end

return count
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Acquire,
    Extend,
    Release,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Extend => "extend",
            Self::Release => "release",
        }
    }

    /// Whether a node reporting `affected` keys out of `expected` counts as a
    /// vote in favour.
    ///
    /// Release skips keys held under another token, so any count leaves the
    /// node without our token and is accepted.
    pub fn accepts(&self, affected: i64, expected: usize) -> bool {
        match self {
            Self::Acquire | Self::Extend => {
                usize::try_from(affected).is_ok_and(|affected| affected == expected)
            }
            Self::Release => affected >= 0,
        }
    }
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Script {
    pub kind: ScriptKind,
    pub body: &'static str,
    pub sha: String,
}

impl Script {
    fn new(kind: ScriptKind, body: &'static str) -> Self {
        Self {
            kind,
            body,
            sha: sha1_hex(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptSet {
    pub acquire: Script,
    pub extend: Script,
    pub release: Script,
}

static STANDARD_SCRIPTS: OnceLock<Arc<ScriptSet>> = OnceLock::new();

impl ScriptSet {
    pub fn new() -> Self {
        Self {
            acquire: Script::new(ScriptKind::Acquire, ACQUIRE_SCRIPT),
            extend: Script::new(ScriptKind::Extend, EXTEND_SCRIPT),
            release: Script::new(ScriptKind::Release, RELEASE_SCRIPT),
        }
    }

    /// Process-wide script set, hashed on first use.
    pub fn standard() -> Arc<ScriptSet> {
        Arc::clone(STANDARD_SCRIPTS.get_or_init(|| Arc::new(ScriptSet::new())))
    }

    pub fn get(&self, kind: ScriptKind) -> &Script {
        match kind {
            ScriptKind::Acquire => &self.acquire,
            ScriptKind::Extend => &self.extend,
            ScriptKind::Release => &self.release,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Script> {
        [&self.acquire, &self.extend, &self.release].into_iter()
    }

    pub fn lookup_sha(&self, sha: &str) -> Option<ScriptKind> {
        self.iter()
            .find(|script| script.sha.eq_ignore_ascii_case(sha))
            .map(|script| script.kind)
    }

    pub fn lookup_body(&self, body: &str) -> Option<ScriptKind> {
        self.iter()
            .find(|script| script.body == body)
            .map(|script| script.kind)
    }
}

impl Default for ScriptSet {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sha1_hex(body: &str) -> String {
    hex::encode(digest(&SHA1_FOR_LEGACY_USE_ONLY, body.as_bytes()).as_ref())
}

//! Cache key codec
//!
//! Keys are colon-separated segments: `<provider>:<namespace>:<field1>:...`.
//! The number and meaning of the fields is defined per namespace by a
//! [`KeySchema`]; a [`KeyCodec`] holds the registered schemas and encodes,
//! decodes and builds glob patterns. [`Glob`] is the single glob
//! implementation every backing store matches keys with.

use crate::error::{CacheError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Segment separator
pub const SEPARATOR: char = ':';

/// Wildcard allowed only in glob patterns
pub const WILDCARD: char = '*';

/// Well-known namespace names
pub mod namespaces {
    pub const APPLICATIONS: &str = "applications";
    pub const CLUSTERS: &str = "clusters";
    pub const SERVER_GROUPS: &str = "serverGroups";
    pub const INSTANCES: &str = "instances";
    pub const LOAD_BALANCERS: &str = "loadBalancers";
    pub const INSTANCE_TYPES: &str = "instanceTypes";
    pub const IMAGES: &str = "images";
    pub const TAGGED_IMAGES: &str = "taggedImages";
    pub const FUNCTIONS: &str = "functions";
}

/// Field layout for the keys of one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    /// Namespace the schema applies to
    pub namespace: String,

    /// Ordered field names following the namespace segment
    pub fields: Vec<String>,

    /// When true the last field keeps any remaining `:` (ARN-like ids)
    pub greedy_tail: bool,
}

impl KeySchema {
    /// Create a schema with the given field names
    pub fn new(namespace: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            namespace: namespace.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            greedy_tail: false,
        }
    }

    /// Allow the last field to contain the separator
    pub fn with_greedy_tail(mut self) -> Self {
        self.greedy_tail = true;
        self
    }

    /// Number of fields after the namespace segment
    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }
}

/// A decoded cache key
#[derive(Debug, Clone)]
pub struct CacheKey {
    provider: String,
    namespace: String,
    fields: Vec<String>,
    schema: Arc<KeySchema>,
}

impl CacheKey {
    /// Cloud provider id (first segment)
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Namespace (second segment)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Field values in schema order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Look up a field by its schema name
    pub fn field(&self, name: &str) -> Option<&str> {
        self.schema
            .position(name)
            .and_then(|i| self.fields.get(i))
            .map(String::as_str)
    }

    /// The schema this key was decoded with
    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.provider == other.provider
            && self.namespace == other.namespace
            && self.fields == other.fields
    }
}

impl Eq for CacheKey {}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.provider, SEPARATOR, self.namespace)?;
        for field in &self.fields {
            write!(f, "{}{}", SEPARATOR, field)?;
        }
        Ok(())
    }
}

/// Registry of key schemas, keyed by provider and namespace
///
/// A schema registered without a provider applies to every provider that
/// has no schema of its own for that namespace.
#[derive(Debug, Clone, Default)]
pub struct KeyCodec {
    schemas: HashMap<(Option<String>, String), Arc<KeySchema>>,
}

impl KeyCodec {
    /// Create an empty codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec with the common resource shapes registered for `provider`
    pub fn standard(provider: &str) -> Self {
        use namespaces::*;

        let mut codec = Self::new();
        for schema in [
            KeySchema::new(APPLICATIONS, &["application"]),
            KeySchema::new(CLUSTERS, &["application", "account", "cluster"]),
            KeySchema::new(SERVER_GROUPS, &["cluster", "account", "region", "serverGroup"]),
            KeySchema::new(INSTANCES, &["account", "region", "instanceId"]),
            KeySchema::new(LOAD_BALANCERS, &["account", "region", "loadBalancer"]),
            KeySchema::new(INSTANCE_TYPES, &["account", "region", "instanceType"]),
            KeySchema::new(IMAGES, &["account", "region", "imageId"]),
            KeySchema::new(TAGGED_IMAGES, &["account", "repository", "tag"]),
            KeySchema::new(FUNCTIONS, &["account", "region", "functionName"]),
        ] {
            codec.register(Some(provider), schema);
        }
        codec
    }

    /// Register a schema, optionally restricted to one provider
    pub fn register(&mut self, provider: Option<&str>, schema: KeySchema) {
        let key = (provider.map(str::to_string), schema.namespace.clone());
        self.schemas.insert(key, Arc::new(schema));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_schema(mut self, provider: Option<&str>, schema: KeySchema) -> Self {
        self.register(provider, schema);
        self
    }

    /// Find the schema for a provider/namespace pair
    pub fn schema_for(&self, provider: &str, namespace: &str) -> Option<&Arc<KeySchema>> {
        self.schemas
            .get(&(Some(provider.to_string()), namespace.to_string()))
            .or_else(|| self.schemas.get(&(None, namespace.to_string())))
    }

    /// Encode a key from its segments
    pub fn encode(&self, provider: &str, namespace: &str, fields: &[&str]) -> Result<String> {
        let schema = self.schema_for(provider, namespace);
        let rendered = render(provider, namespace, fields);

        check_segment(&rendered, provider, false)?;
        check_segment(&rendered, namespace, false)?;

        if let Some(schema) = schema {
            if fields.len() != schema.arity() {
                return Err(CacheError::malformed(
                    rendered,
                    format!("expected {} fields, found {}", schema.arity(), fields.len()),
                ));
            }
        }

        let greedy = schema.map(|s| s.greedy_tail).unwrap_or(false);
        for (i, field) in fields.iter().enumerate() {
            let is_tail = i + 1 == fields.len();
            check_segment(&rendered, field, greedy && is_tail)?;
        }

        Ok(rendered)
    }

    /// Decode a key using the registered schema for its namespace
    pub fn decode(&self, key: &str) -> Result<CacheKey> {
        let mut parts = key.splitn(3, SEPARATOR);
        let provider = parts.next().unwrap_or_default();
        let namespace = parts
            .next()
            .ok_or_else(|| CacheError::malformed(key, "missing namespace segment"))?;
        let rest = parts.next();

        if provider.is_empty() || namespace.is_empty() {
            return Err(CacheError::malformed(key, "empty provider or namespace"));
        }

        let schema = self
            .schema_for(provider, namespace)
            .ok_or_else(|| CacheError::malformed(key, format!("unknown namespace {}", namespace)))?
            .clone();

        let fields: Vec<String> = match rest {
            None => Vec::new(),
            Some(rest) if schema.greedy_tail && schema.arity() > 0 => rest
                .splitn(schema.arity(), SEPARATOR)
                .map(str::to_string)
                .collect(),
            Some(rest) => rest.split(SEPARATOR).map(str::to_string).collect(),
        };

        if fields.len() != schema.arity() {
            return Err(CacheError::malformed(
                key,
                format!("expected {} fields, found {}", schema.arity(), fields.len()),
            ));
        }
        if fields.iter().any(|f| f.is_empty()) {
            return Err(CacheError::malformed(key, "empty field"));
        }

        Ok(CacheKey {
            provider: provider.to_string(),
            namespace: namespace.to_string(),
            fields,
            schema,
        })
    }

    /// Decode, returning `None` for foreign or historical key shapes
    pub fn try_decode(&self, key: &str) -> Option<CacheKey> {
        match self.decode(key) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                debug!("Skipping undecodable key: {}", e);
                None
            }
        }
    }

    /// Build a glob pattern; missing trailing fields are filled with `*`
    pub fn glob_for(&self, provider: &str, namespace: &str, fields: &[&str]) -> String {
        let arity = self
            .schema_for(provider, namespace)
            .map(|s| s.arity())
            .unwrap_or(fields.len());

        let mut segments: Vec<&str> = fields.to_vec();
        while segments.len() < arity {
            segments.push("*");
        }
        if segments.is_empty() {
            segments.push("*");
        }
        render(provider, namespace, &segments)
    }
}

fn render(provider: &str, namespace: &str, fields: &[&str]) -> String {
    let mut key = format!("{}{}{}", provider, SEPARATOR, namespace);
    for field in fields {
        key.push(SEPARATOR);
        key.push_str(field);
    }
    key
}

fn check_segment(key: &str, segment: &str, allow_separator: bool) -> Result<()> {
    if segment.is_empty() {
        return Err(CacheError::malformed(key, "empty segment"));
    }
    if segment.contains(WILDCARD) {
        return Err(CacheError::malformed(key, "wildcard in stored key"));
    }
    if !allow_separator && segment.contains(SEPARATOR) {
        return Err(CacheError::malformed(
            key,
            format!("segment '{}' contains separator", segment),
        ));
    }
    Ok(())
}

/// A compiled glob pattern over cache keys
///
/// `*` matches any run of characters (separators included), `?` matches
/// exactly one character and `\` escapes the character after it.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    source: String,
    regex: Regex,
    literal: bool,
}

impl Glob {
    /// Compile a glob pattern
    pub fn new(pattern: &str) -> Result<Self> {
        let (source, literal) = translate(pattern);
        let regex = Regex::new(&source)
            .map_err(|e| CacheError::malformed(pattern, format!("invalid glob: {}", e)))?;

        Ok(Self {
            pattern: pattern.to_string(),
            source,
            regex,
            literal,
        })
    }

    /// Check whether a key matches
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// The original pattern text
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Anchored regular expression equivalent to this glob
    pub fn to_regex_source(&self) -> &str {
        &self.source
    }

    /// True when the pattern has no wildcards and names exactly one key
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    /// The single key a literal pattern names (escapes removed)
    pub fn literal_key(&self) -> Option<String> {
        if !self.literal {
            return None;
        }
        let mut out = String::with_capacity(self.pattern.len());
        let mut chars = self.pattern.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        Some(out)
    }

    /// True when at least one key matches both this glob and `other`
    pub fn overlaps(&self, other: &Glob) -> bool {
        let a = tokenize(&self.pattern);
        let b = tokenize(&other.pattern);
        let (n, m) = (a.len(), b.len());

        // reach[i][j]: the suffixes a[i..] and b[j..] share a match
        let mut reach = vec![vec![false; m + 1]; n + 1];
        reach[n][m] = true;
        for i in (0..=n).rev() {
            for j in (0..=m).rev() {
                if i == n && j == m {
                    continue;
                }
                let mut ok = false;
                if i < n && a[i] == Token::Star {
                    ok |= reach[i + 1][j];
                }
                if j < m && b[j] == Token::Star {
                    ok |= reach[i][j + 1];
                }
                if i < n && j < m {
                    ok |= match (a[i], b[j]) {
                        (Token::Star, Token::Star) => false,
                        (Token::Star, _) => reach[i][j + 1],
                        (_, Token::Star) => reach[i + 1][j],
                        (x, y) => x.accepts(y) && reach[i + 1][j + 1],
                    };
                }
                reach[i][j] = ok;
            }
        }
        reach[0][0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Char(char),
    One,
    Star,
}

impl Token {
    fn accepts(self, other: Token) -> bool {
        match (self, other) {
            (Token::Char(x), Token::Char(y)) => x == y,
            _ => true,
        }
    }
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' => Token::Star,
            '?' => Token::One,
            '\\' => Token::Char(chars.next().unwrap_or('\\')),
            other => Token::Char(other),
        });
    }
    tokens
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn translate(pattern: &str) -> (String, bool) {
    let mut source = String::from("(?s)^");
    let mut literal = true;
    let mut chars = pattern.chars();
    let mut buf = [0u8; 4];

    while let Some(c) = chars.next() {
        match c {
            '*' => {
                literal = false;
                source.push_str(".*");
            }
            '?' => {
                literal = false;
                source.push('.');
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    source.push_str(&regex::escape(next.encode_utf8(&mut buf)));
                } else {
                    source.push_str(&regex::escape("\\"));
                }
            }
            other => source.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }

    source.push('$');
    (source, literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> KeyCodec {
        KeyCodec::standard("aws")
    }

    #[test]
    fn test_encode_decode() {
        let codec = codec();
        let key = codec
            .encode("aws", "serverGroups", &["myapp-prod", "prod", "us-east-1", "myapp-prod-v001"])
            .unwrap();
        assert_eq!(key, "aws:serverGroups:myapp-prod:prod:us-east-1:myapp-prod-v001");

        let decoded = codec.decode(&key).unwrap();
        assert_eq!(decoded.provider(), "aws");
        assert_eq!(decoded.namespace(), "serverGroups");
        assert_eq!(decoded.field("cluster"), Some("myapp-prod"));
        assert_eq!(decoded.field("region"), Some("us-east-1"));
        assert_eq!(decoded.field("nope"), None);
        assert_eq!(decoded.to_string(), key);
    }

    #[test]
    fn test_encode_rejects_bad_segments() {
        let codec = codec();
        assert!(codec.encode("aws", "clusters", &["app", "prod"]).is_err());
        assert!(codec.encode("aws", "clusters", &["app", "prod", "app-*"]).is_err());
        assert!(codec.encode("aws", "clusters", &["app", "", "app-main"]).is_err());
        assert!(codec.encode("aws", "clusters", &["app", "a:b", "app-main"]).is_err());
    }

    #[test]
    fn test_decode_unknown_and_wrong_shape() {
        let codec = codec();
        assert!(matches!(
            codec.decode("aws:clusters:app:prod"),
            Err(CacheError::MalformedKey { .. })
        ));
        assert!(codec.decode("aws:unknownThings:a:b").is_err());
        assert!(codec.decode("garbage").is_err());
        assert!(codec.decode("gce:clusters:app:prod:app-main").is_err());
        assert!(codec.try_decode("aws:clusters:app:prod:app-main:extra").is_none());
    }

    #[test]
    fn test_provider_fallback_schema() {
        let codec = KeyCodec::new().with_schema(None, KeySchema::new("clusters", &["application", "account", "cluster"]));
        assert!(codec.decode("gce:clusters:app:prod:app-main").is_ok());
        assert!(codec.decode("titus:clusters:app:prod:app-main").is_ok());
    }

    #[test]
    fn test_greedy_tail() {
        let codec = KeyCodec::new().with_schema(
            Some("aws"),
            KeySchema::new("certificates", &["account", "arn"]).with_greedy_tail(),
        );
        let arn = "arn:aws:acm:us-east-1:123:certificate/abc";
        let key = codec.encode("aws", "certificates", &["prod", arn]).unwrap();
        let decoded = codec.decode(&key).unwrap();
        assert_eq!(decoded.field("arn"), Some(arn));

        // separators are still rejected before the tail
        assert!(codec.encode("aws", "certificates", &["pr:od", arn]).is_err());
    }

    #[test]
    fn test_glob_for_pads_missing_fields() {
        let codec = codec();
        assert_eq!(
            codec.glob_for("aws", "serverGroups", &["*", "prod", "us-east-1"]),
            "aws:serverGroups:*:prod:us-east-1:*"
        );
        assert_eq!(codec.glob_for("aws", "unknown", &[]), "aws:unknown:*");
    }

    #[test]
    fn test_glob_matching() {
        let glob = Glob::new("aws:serverGroups:myapp-*:prod:*").unwrap();
        assert!(glob.matches("aws:serverGroups:myapp-v001:prod:us-east-1"));
        assert!(glob.matches("aws:serverGroups:myapp-v002:prod:eu-west-1"));
        assert!(!glob.matches("aws:serverGroups:otherapp-v001:prod:us-east-1"));
        assert!(!glob.is_literal());
    }

    #[test]
    fn test_glob_overlap() {
        let east = Glob::new("aws:serverGroups:*:prod:us-east-1:*").unwrap();
        let west = Glob::new("aws:serverGroups:*:prod:eu-west-1:*").unwrap();
        let all = Glob::new("aws:serverGroups:*").unwrap();
        let prod = Glob::new("aws:serverGroups:*:prod:*").unwrap();

        assert!(east.overlaps(&east));
        assert!(east.overlaps(&all));
        assert!(all.overlaps(&east));
        assert!(prod.overlaps(&west));
        assert!(!east.overlaps(&west));

        // wildcards in front of the region still overlap
        let cluster = Glob::new("aws:serverGroups:app-main:*").unwrap();
        assert!(cluster.overlaps(&west));

        let single = Glob::new("aws:images:a:ami-?").unwrap();
        assert!(single.overlaps(&Glob::new("aws:images:a:ami-1").unwrap()));
        assert!(!single.overlaps(&Glob::new("aws:images:a:ami-12").unwrap()));
        assert!(!Glob::new(r"aws:odd:a\*").unwrap().overlaps(&Glob::new("aws:odd:ab").unwrap()));
    }

    #[test]
    fn test_glob_special_characters() {
        let glob = Glob::new("aws:images:prod:us-east-1:ami-(1).x").unwrap();
        assert!(glob.is_literal());
        assert!(glob.matches("aws:images:prod:us-east-1:ami-(1).x"));
        assert!(!glob.matches("aws:images:prod:us-east-1:ami-(1)Xx"));

        let single = Glob::new("aws:clusters:app:prod:app-v00?").unwrap();
        assert!(single.matches("aws:clusters:app:prod:app-v001"));
        assert!(!single.matches("aws:clusters:app:prod:app-v0010"));

        let escaped = Glob::new(r"aws:odd:a\*b").unwrap();
        assert!(escaped.is_literal());
        assert!(escaped.matches("aws:odd:a*b"));
        assert!(!escaped.matches("aws:odd:axxb"));
        assert_eq!(escaped.literal_key(), Some("aws:odd:a*b".to_string()));
    }

    #[test]
    fn test_glob_is_case_sensitive() {
        let glob = Glob::new("aws:clusters:MyApp:*").unwrap();
        assert!(glob.matches("aws:clusters:MyApp:prod:MyApp-main"));
        assert!(!glob.matches("aws:clusters:myapp:prod:myapp-main"));
    }
}

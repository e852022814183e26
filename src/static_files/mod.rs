//! Static file serving with a validation cache
//!
//! Files are cached in memory keyed by canonical path; every hit re-checks
//! the `(mtime, size)` pair against the filesystem and reloads on mismatch,
//! so a changed file is never served stale. Compressed variants are built
//! once alongside the raw bytes and chosen at serve time from
//! `Accept-Encoding`.

use bytes::Bytes;
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::StatusCode;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::config::{SecurityHeadersConfig, StaticConfig};

#[derive(Debug, thiserror::Error)]
pub enum StaticError {
    #[error("static file serving disabled")]
    Disabled,

    #[error("file not found")]
    NotFound,

    #[error("unsafe request path")]
    UnsafePath,

    #[error("file read failed: {0}")]
    Read(#[source] std::io::Error),
}

impl StaticError {
    /// Unsafe paths answer 404, never 500, so probes learn nothing
    pub fn client_status(&self) -> StatusCode {
        match self {
            StaticError::Disabled | StaticError::NotFound | StaticError::UnsafePath => {
                StatusCode::NOT_FOUND
            }
            StaticError::Read(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A finished static response; the body buffer is owned by this value until
/// it is emitted to the transport
#[derive(Debug)]
pub struct StaticResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
struct CachedFile {
    content: Bytes,
    compressed: Option<Bytes>,
    etag: String,
    content_type: String,
    mtime: SystemTime,
    size: u64,
}

/// Point-in-time cache statistics for `/status`
#[derive(Debug, Clone, serde::Serialize)]
pub struct StaticCacheStats {
    pub cached_files: usize,
    pub cached_bytes: u64,
    pub compressed_files: usize,
}

pub struct StaticFileServer {
    config: StaticConfig,
    security: SecurityHeadersConfig,
    cache: DashMap<PathBuf, CachedFile>,
    mime_types: HashMap<&'static str, &'static str>,
}

impl StaticFileServer {
    pub fn new(config: StaticConfig, security: SecurityHeadersConfig) -> Self {
        Self {
            config,
            security,
            cache: DashMap::new(),
            mime_types: mime_type_map(),
        }
    }

    /// Serve `request_path` relative to the configured root
    pub async fn serve(
        &self,
        request_path: &str,
        headers: &HeaderMap,
    ) -> Result<StaticResponse, StaticError> {
        if !self.config.enabled {
            return Err(StaticError::Disabled);
        }

        let relative = sanitize_path(request_path)?;

        let root = tokio::fs::canonicalize(&self.config.root)
            .await
            .map_err(|_| StaticError::NotFound)?;
        let target = root.join(&relative);

        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|_| StaticError::NotFound)?;

        if metadata.is_dir() {
            if let Some(index) = self.resolve_index(&target).await {
                return self.serve_file(&root, &index, headers).await;
            }
            if self.config.autoindex {
                return self.directory_listing(&target).await;
            }
            return Err(StaticError::NotFound);
        }

        self.serve_file(&root, &target, headers).await
    }

    /// Try the configured index files inside a directory, in order
    async fn resolve_index(&self, dir: &Path) -> Option<PathBuf> {
        for name in &self.config.index_files {
            let candidate = dir.join(name);
            if let Ok(metadata) = tokio::fs::metadata(&candidate).await {
                if metadata.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    async fn serve_file(
        &self,
        root: &Path,
        target: &Path,
        headers: &HeaderMap,
    ) -> Result<StaticResponse, StaticError> {
        // Canonicalize to chase symlinks; anything resolving outside the
        // root is treated as missing.
        let canonical = tokio::fs::canonicalize(target)
            .await
            .map_err(|_| StaticError::NotFound)?;
        if !canonical.starts_with(root) {
            warn!(path = %canonical.display(), "request escaped static root");
            return Err(StaticError::NotFound);
        }

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|_| StaticError::NotFound)?;
        if !metadata.is_file() {
            return Err(StaticError::NotFound);
        }

        let cached = self.load_cached(&canonical, &metadata).await?;

        if self.not_modified(&cached, headers) {
            return Ok(self.not_modified_response(&cached));
        }

        let accepts_gzip = headers
            .get("accept-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);

        let (body, encoding) = match (&cached.compressed, accepts_gzip) {
            (Some(compressed), true) => (compressed.clone(), Some("gzip")),
            _ => (cached.content.clone(), None),
        };

        let mut response_headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&cached.content_type) {
            response_headers.insert("content-type", value);
        }
        response_headers.insert("content-length", HeaderValue::from(body.len()));
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(cached.mtime)) {
            response_headers.insert("last-modified", value);
        }
        if self.config.etag {
            if let Ok(value) = HeaderValue::from_str(&cached.etag) {
                response_headers.insert("etag", value);
            }
        }
        if let Some(encoding) = encoding {
            response_headers.insert("content-encoding", HeaderValue::from_static(encoding));
        }
        if cached.compressed.is_some() {
            response_headers.insert("vary", HeaderValue::from_static("Accept-Encoding"));
        }
        self.apply_policy_headers(&mut response_headers);

        Ok(StaticResponse {
            status: StatusCode::OK,
            headers: response_headers,
            body,
        })
    }

    /// Fetch from cache, validating `(mtime, size)` against the live stat
    async fn load_cached(
        &self,
        path: &Path,
        metadata: &std::fs::Metadata,
    ) -> Result<CachedFile, StaticError> {
        let mtime = metadata.modified().map_err(StaticError::Read)?;
        let size = metadata.len();

        if let Some(entry) = self.cache.get(path) {
            if entry.mtime == mtime && entry.size == size {
                return Ok(entry.clone());
            }
            debug!(path = %path.display(), "cache entry invalidated");
        }

        let content = tokio::fs::read(path).await.map_err(StaticError::Read)?;
        let content = Bytes::from(content);

        let content_type = self.content_type_for(path);
        let etag = compute_etag(path, size, mtime);

        let compressed = if self.config.compression && self.is_compressible(&content_type) {
            match gzip(&content) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "gzip failed, serving raw only");
                    None
                }
            }
        } else {
            None
        };

        let cached = CachedFile {
            content,
            compressed,
            etag,
            content_type,
            mtime,
            size,
        };
        self.cache.insert(path.to_path_buf(), cached.clone());

        Ok(cached)
    }

    fn not_modified(&self, cached: &CachedFile, headers: &HeaderMap) -> bool {
        if self.config.etag {
            if let Some(inm) = headers.get("if-none-match").and_then(|v| v.to_str().ok()) {
                if inm.contains(cached.etag.as_str()) {
                    return true;
                }
            }
        }

        // Any unparseable If-Modified-Since counts as modified.
        if let Some(ims) = headers
            .get("if-modified-since")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(since) = httpdate::parse_http_date(ims) {
                if cached.mtime <= since {
                    return true;
                }
            }
        }

        false
    }

    fn not_modified_response(&self, cached: &CachedFile) -> StaticResponse {
        let mut headers = HeaderMap::new();
        if self.config.etag {
            if let Ok(value) = HeaderValue::from_str(&cached.etag) {
                headers.insert("etag", value);
            }
        }
        self.apply_policy_headers(&mut headers);

        StaticResponse {
            status: StatusCode::NOT_MODIFIED,
            headers,
            body: Bytes::new(),
        }
    }

    /// Security headers on every static response; HSTS and CSP only when
    /// configured
    fn apply_policy_headers(&self, headers: &mut HeaderMap) {
        headers.insert(
            "x-content-type-options",
            HeaderValue::from_static("nosniff"),
        );
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));

        if let Some(cache_control) = &self.config.cache_control {
            if let Ok(value) = HeaderValue::from_str(cache_control) {
                headers.insert("cache-control", value);
            }
        }
        if let Some(hsts) = &self.security.hsts {
            if let Ok(value) = HeaderValue::from_str(hsts) {
                headers.insert("strict-transport-security", value);
            }
        }
        if let Some(csp) = &self.security.csp {
            if let Ok(value) = HeaderValue::from_str(csp) {
                headers.insert("content-security-policy", value);
            }
        }
    }

    /// Autoindex listing: entry names only
    async fn directory_listing(&self, dir: &Path) -> Result<StaticResponse, StaticError> {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(StaticError::Read)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StaticError::Read)? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let mut html = String::from(
            "<!DOCTYPE html>\n<html>\n<head><title>Index</title></head>\n<body>\n<h1>Index</h1>\n<ul>\n",
        );
        for name in &names {
            let escaped = escape_html(name);
            html.push_str(&format!("<li><a href=\"{}\">{}</a></li>\n", escaped, escaped));
        }
        html.push_str("</ul>\n</body>\n</html>\n");

        let body = Bytes::from(html);
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        headers.insert("content-length", HeaderValue::from(body.len()));
        self.apply_policy_headers(&mut headers);

        Ok(StaticResponse {
            status: StatusCode::OK,
            headers,
            body,
        })
    }

    fn content_type_for(&self, path: &Path) -> String {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        self.mime_types
            .get(extension.as_str())
            .copied()
            .unwrap_or("application/octet-stream")
            .to_string()
    }

    fn is_compressible(&self, content_type: &str) -> bool {
        self.config
            .compression_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }

    pub fn cache_stats(&self) -> StaticCacheStats {
        let mut bytes = 0u64;
        let mut compressed = 0usize;
        for entry in self.cache.iter() {
            bytes += entry.size;
            if entry.compressed.is_some() {
                compressed += 1;
            }
        }
        StaticCacheStats {
            cached_files: self.cache.len(),
            cached_bytes: bytes,
            compressed_files: compressed,
        }
    }
}

/// Segment-wise path sanitization
///
/// Empty and `.` segments drop, `..` pops (never below the root), control
/// characters reject the whole path.
fn sanitize_path(raw: &str) -> Result<PathBuf, StaticError> {
    let mut stack: Vec<&str> = Vec::new();

    for segment in raw.split('/') {
        if segment.bytes().any(|b| b < 0x20 || b == 0x7f) {
            return Err(StaticError::UnsafePath);
        }
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    Ok(stack.iter().collect())
}

/// `"hex(sha256(path ‖ size ‖ mtime))"` rendered lowercase
fn compute_etag(path: &Path, size: u64, mtime: SystemTime) -> String {
    let mtime_secs = mtime
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(size.to_string().as_bytes());
    hasher.update(mtime_secs.to_string().as_bytes());

    format!("\"{}\"", hex::encode(hasher.finalize()))
}

fn gzip(content: &Bytes) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    Ok(Bytes::from(encoder.finish()?))
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn mime_type_map() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();

    map.insert("html", "text/html; charset=utf-8");
    map.insert("htm", "text/html; charset=utf-8");
    map.insert("txt", "text/plain; charset=utf-8");
    map.insert("css", "text/css; charset=utf-8");
    map.insert("js", "application/javascript; charset=utf-8");
    map.insert("json", "application/json; charset=utf-8");
    map.insert("xml", "application/xml; charset=utf-8");

    map.insert("png", "image/png");
    map.insert("jpg", "image/jpeg");
    map.insert("jpeg", "image/jpeg");
    map.insert("gif", "image/gif");
    map.insert("svg", "image/svg+xml");
    map.insert("ico", "image/x-icon");
    map.insert("webp", "image/webp");

    map.insert("woff", "font/woff");
    map.insert("woff2", "font/woff2");
    map.insert("ttf", "font/ttf");
    map.insert("otf", "font/otf");

    map.insert("pdf", "application/pdf");
    map.insert("zip", "application/zip");
    map.insert("tar", "application/x-tar");
    map.insert("gz", "application/gzip");

    map.insert("mp4", "video/mp4");
    map.insert("webm", "video/webm");
    map.insert("mp3", "audio/mpeg");
    map.insert("wav", "audio/wav");
    map.insert("ogg", "audio/ogg");

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server_for(root: &Path) -> StaticFileServer {
        StaticFileServer::new(
            StaticConfig {
                root: root.to_string_lossy().into_owned(),
                ..StaticConfig::default()
            },
            SecurityHeadersConfig::default(),
        )
    }

    #[test]
    fn test_sanitize_drops_dot_segments() {
        assert_eq!(
            sanitize_path("/a/./b//c").unwrap(),
            PathBuf::from("a/b/c")
        );
    }

    #[test]
    fn test_sanitize_pops_parent_segments() {
        assert_eq!(sanitize_path("/a/b/../c").unwrap(), PathBuf::from("a/c"));
        // Never below the root.
        assert_eq!(
            sanitize_path("/../../../etc/passwd").unwrap(),
            PathBuf::from("etc/passwd")
        );
    }

    #[test]
    fn test_sanitize_rejects_control_chars() {
        assert!(matches!(
            sanitize_path("/a\x01b"),
            Err(StaticError::UnsafePath)
        ));
        assert!(matches!(
            sanitize_path("/a\x7fb"),
            Err(StaticError::UnsafePath)
        ));
    }

    #[test]
    fn test_etag_shape() {
        let etag = compute_etag(Path::new("/srv/www/index.html"), 13, SystemTime::UNIX_EPOCH);
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        // sha256 hex digest inside the quotes
        assert_eq!(etag.len(), 66);
        assert!(etag[1..65].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(etag.to_lowercase(), etag);
    }

    #[tokio::test]
    async fn test_serve_file_with_headers() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello wraith").unwrap();
        let server = server_for(dir.path());

        let response = server.serve("/hello.txt", &HeaderMap::new()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"hello wraith");
        assert_eq!(
            response.headers.get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers.get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers.get("x-frame-options").unwrap(), "DENY");
        assert!(response.headers.get("etag").is_some());
        assert!(response.headers.get("last-modified").is_some());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let server = server_for(dir.path());

        let err = server.serve("/nope.txt", &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, StaticError::NotFound));
        assert_eq!(err.client_status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_attempt_is_not_found_never_500() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("public")).unwrap();
        let server = server_for(&dir.path().join("public"));

        let err = server
            .serve("/../secret.txt", &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.client_status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_index_file_resolution() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
        let server = server_for(dir.path());

        let response = server.serve("/", &HeaderMap::new()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"<h1>home</h1>");
        assert!(response.headers.get("etag").is_some());
    }

    #[tokio::test]
    async fn test_directory_without_index_404s_when_autoindex_off() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let server = server_for(dir.path());

        let err = server.serve("/sub", &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, StaticError::NotFound));
    }

    #[tokio::test]
    async fn test_autoindex_lists_names_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let server = StaticFileServer::new(
            StaticConfig {
                root: dir.path().to_string_lossy().into_owned(),
                autoindex: true,
                index_files: vec![],
                ..StaticConfig::default()
            },
            SecurityHeadersConfig::default(),
        );

        let response = server.serve("/", &HeaderMap::new()).await.unwrap();
        let html = String::from_utf8(response.body.to_vec()).unwrap();
        assert!(html.contains("a.txt"));
        assert!(html.contains("b.txt"));
        // Names only: no sizes or dates.
        assert!(!html.contains("bytes"));
    }

    #[tokio::test]
    async fn test_conditional_if_none_match() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("page.html"), b"content").unwrap();
        let server = server_for(dir.path());

        let first = server.serve("/page.html", &HeaderMap::new()).await.unwrap();
        let etag = first.headers.get("etag").unwrap().clone();

        let mut headers = HeaderMap::new();
        headers.insert("if-none-match", etag.clone());

        let second = server.serve("/page.html", &headers).await.unwrap();
        assert_eq!(second.status, StatusCode::NOT_MODIFIED);
        assert!(second.body.is_empty());
        assert_eq!(second.headers.get("etag").unwrap(), &etag);
    }

    #[tokio::test]
    async fn test_bad_if_modified_since_is_modified() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("page.html"), b"content").unwrap();
        let server = server_for(dir.path());

        let mut headers = HeaderMap::new();
        headers.insert(
            "if-modified-since",
            HeaderValue::from_static("not a date"),
        );

        let response = server.serve("/page.html", &headers).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_gzip_variant_served_on_accept_encoding() {
        let dir = TempDir::new().unwrap();
        let text = "wraith ".repeat(200);
        std::fs::write(dir.path().join("big.txt"), &text).unwrap();
        let server = server_for(dir.path());

        let plain = server.serve("/big.txt", &HeaderMap::new()).await.unwrap();
        assert!(plain.headers.get("content-encoding").is_none());
        assert_eq!(plain.body.len(), text.len());

        let mut headers = HeaderMap::new();
        headers.insert("accept-encoding", HeaderValue::from_static("gzip, br"));

        let compressed = server.serve("/big.txt", &headers).await.unwrap();
        assert_eq!(compressed.headers.get("content-encoding").unwrap(), "gzip");
        assert!(compressed.body.len() < text.len());
    }

    #[tokio::test]
    async fn test_binary_types_not_compressed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("img.png"), vec![0u8; 512]).unwrap();
        let server = server_for(dir.path());

        let mut headers = HeaderMap::new();
        headers.insert("accept-encoding", HeaderValue::from_static("gzip"));

        let response = server.serve("/img.png", &headers).await.unwrap();
        assert!(response.headers.get("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_change() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, b"version one!").unwrap();
        let server = server_for(dir.path());

        let first = server.serve("/data.txt", &HeaderMap::new()).await.unwrap();
        assert_eq!(&first.body[..], b"version one!");
        let first_etag = first.headers.get("etag").unwrap().clone();

        // Same mtime granularity issues are avoided by changing the size.
        std::fs::write(&file, b"version two is longer").unwrap();

        let second = server.serve("/data.txt", &HeaderMap::new()).await.unwrap();
        assert_eq!(&second.body[..], b"version two is longer");
        assert_ne!(second.headers.get("etag").unwrap(), &first_etag);
    }

    #[tokio::test]
    async fn test_concurrent_requests_identical_content() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"stable bytes").unwrap();
        let server = std::sync::Arc::new(server_for(dir.path()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                server.serve("/f.txt", &HeaderMap::new()).await.unwrap()
            }));
        }

        let mut bodies = Vec::new();
        let mut etags = Vec::new();
        for handle in handles {
            let response = handle.await.unwrap();
            bodies.push(response.body);
            etags.push(response.headers.get("etag").unwrap().clone());
        }

        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
        assert!(etags.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_disabled_server_rejects() {
        let dir = TempDir::new().unwrap();
        let server = StaticFileServer::new(
            StaticConfig {
                enabled: false,
                root: dir.path().to_string_lossy().into_owned(),
                ..StaticConfig::default()
            },
            SecurityHeadersConfig::default(),
        );

        let err = server.serve("/x", &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, StaticError::Disabled));
        assert_eq!(err.client_status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hsts_and_csp_injected_when_configured() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let server = StaticFileServer::new(
            StaticConfig {
                root: dir.path().to_string_lossy().into_owned(),
                ..StaticConfig::default()
            },
            SecurityHeadersConfig {
                hsts: Some("max-age=63072000".to_string()),
                csp: Some("default-src 'self'".to_string()),
            },
        );

        let response = server.serve("/a.txt", &HeaderMap::new()).await.unwrap();
        assert_eq!(
            response.headers.get("strict-transport-security").unwrap(),
            "max-age=63072000"
        );
        assert_eq!(
            response.headers.get("content-security-policy").unwrap(),
            "default-src 'self'"
        );
    }
}

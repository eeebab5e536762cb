//! URI-based resource resolution.
//!
//! Providers register the schemes they serve; the resolver maps an input
//! string to a provider and asks it for a generator. Bare paths without a
//! scheme are normalized and wrapped under the default scheme, so
//! `sfx/boom.ogg` reaches the default provider as `file:///sfx/boom.ogg`.
//! A missing resource is a `None` result, not an error; an unknown scheme
//! spelled out explicitly is a programmer error.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, Weak};

use crate::dispatch::JobSender;
use crate::error::{Result, SonaraError};
use crate::generator::{decode_all, Decoder, Generator, GeneratorInner, SymphoniaDecoder};

/// Parsed `<scheme>:[/]*<path>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub path: String,
    /// Whether the scheme was spelled out in the input or supplied by the
    /// default.
    pub explicit_scheme: bool,
}

impl Uri {
    /// Parse an input string. A prefix of `[A-Za-z0-9+\-.]+` followed by
    /// `:` qualifies as a scheme; anything else is treated as a path,
    /// normalized (backslashes to forward slashes, leading `/` stripped)
    /// and wrapped under `default_scheme`.
    pub fn parse(input: &str, default_scheme: &str) -> Uri {
        if let Some((scheme, rest)) = split_scheme(input) {
            return Uri {
                scheme: scheme.to_ascii_lowercase(),
                path: rest.trim_start_matches('/').to_string(),
                explicit_scheme: true,
            };
        }
        let normalized = input.replace('\\', "/");
        Uri {
            scheme: default_scheme.to_ascii_lowercase(),
            path: normalized.trim_start_matches('/').to_string(),
            explicit_scheme: false,
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:///{}", self.scheme, self.path)
    }
}

fn split_scheme(input: &str) -> Option<(&str, &str)> {
    let colon = input.find(':')?;
    if colon == 0 {
        return None;
    }
    let prefix = &input[..colon];
    if prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        Some((prefix, &input[colon + 1..]))
    } else {
        None
    }
}

/// Shared services handed to providers so they can construct generators.
pub struct ProviderContext {
    jobs: JobSender,
    stream_buffer_count: usize,
    stream_chunk_frames: usize,
}

impl ProviderContext {
    pub(crate) fn new(
        jobs: JobSender,
        stream_buffer_count: usize,
        stream_chunk_frames: usize,
    ) -> Self {
        Self {
            jobs,
            stream_buffer_count,
            stream_chunk_frames,
        }
    }

    /// Build a static generator from decoded interleaved samples.
    pub fn static_generator(
        &self,
        samples: Vec<f32>,
        format: crate::backend::PcmFormat,
    ) -> Generator {
        Generator::new_static(&self.jobs, format, samples)
    }

    /// Build a streaming generator around a decoder.
    pub fn streaming_generator(&self, decoder: Box<dyn Decoder>) -> Generator {
        Generator::new_streaming(
            &self.jobs,
            decoder,
            self.stream_buffer_count,
            self.stream_chunk_frames,
        )
    }
}

/// A source of generators for one or more URI schemes.
pub trait Provider: Send + Sync {
    /// Schemes this provider serves, lowercase.
    fn schemes(&self) -> &[&str];
    /// Produce a ready-initialized generator for `uri`, or `None` when the
    /// resource does not exist.
    fn resolve(&self, uri: &Uri, ctx: &ProviderContext) -> Result<Option<Generator>>;
}

/// Scheme registry. The table lock is coarse; provider resolution itself
/// runs outside it.
pub struct Resolver {
    providers: Mutex<HashMap<String, std::sync::Arc<dyn Provider>>>,
    default_scheme: Mutex<String>,
    ctx: ProviderContext,
}

impl Resolver {
    pub(crate) fn new(ctx: ProviderContext, default_scheme: &str) -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
            default_scheme: Mutex::new(default_scheme.to_ascii_lowercase()),
            ctx,
        }
    }

    /// Register a provider for each scheme it advertises. Case-insensitive;
    /// last registration wins.
    pub fn register(&self, provider: std::sync::Arc<dyn Provider>) {
        let mut providers = self.providers.lock().unwrap();
        for scheme in provider.schemes() {
            providers.insert(scheme.to_ascii_lowercase(), provider.clone());
        }
    }

    pub fn set_default_scheme(&self, scheme: &str) {
        *self.default_scheme.lock().unwrap() = scheme.to_ascii_lowercase();
    }

    /// Map an input string to a generator. Unknown explicit schemes fail
    /// fast; everything else missing yields `None`.
    pub fn resolve(&self, input: &str) -> Result<Option<Generator>> {
        let default_scheme = self.default_scheme.lock().unwrap().clone();
        let uri = Uri::parse(input, &default_scheme);

        let provider = self.providers.lock().unwrap().get(&uri.scheme).cloned();
        let Some(provider) = provider else {
            if uri.explicit_scheme {
                return Err(SonaraError::Unsupported(format!(
                    "no provider for scheme '{}'",
                    uri.scheme
                )));
            }
            return Ok(None);
        };
        provider.resolve(&uri, &self.ctx)
    }
}

enum CacheSlot {
    /// Another caller is decoding this path right now.
    Loading,
    Ready(Weak<GeneratorInner>),
}

/// Built-in filesystem provider.
///
/// `file:` URIs produce cached static generators keyed by resolved path,
/// decoded at most once per path even under concurrent requests; `stream:`
/// URIs produce a fresh streaming generator per request. Cache entries hold
/// weak handles, so a disposed generator invalidates its entry without any
/// scanning.
pub struct FileProvider {
    search_paths: Vec<PathBuf>,
    absolute_paths_relative: bool,
    cache: Mutex<HashMap<PathBuf, CacheSlot>>,
    loading: Condvar,
}

impl FileProvider {
    pub fn new(search_paths: Vec<PathBuf>, absolute_paths_relative: bool) -> Self {
        Self {
            search_paths,
            absolute_paths_relative,
            cache: Mutex::new(HashMap::new()),
            loading: Condvar::new(),
        }
    }

    /// Map a URI path onto the filesystem; first search-path match wins.
    fn locate(&self, uri_path: &str) -> Option<PathBuf> {
        let raw = Path::new(uri_path);
        if raw.is_absolute() && !self.absolute_paths_relative {
            return raw.exists().then(|| raw.to_path_buf());
        }
        if self.search_paths.is_empty() {
            return raw.exists().then(|| raw.to_path_buf());
        }
        self.search_paths
            .iter()
            .map(|root| root.join(uri_path))
            .find(|candidate| candidate.exists())
    }

    fn cached_static(&self, path: PathBuf, ctx: &ProviderContext) -> Result<Option<Generator>> {
        let mut cache = self.cache.lock().unwrap();
        loop {
            match cache.get(&path) {
                Some(CacheSlot::Ready(weak)) => {
                    if let Some(inner) = weak.upgrade() {
                        return Ok(Some(Generator { inner }));
                    }
                    // The generator was disposed; purge and reload.
                    cache.remove(&path);
                }
                Some(CacheSlot::Loading) => {
                    cache = self.loading.wait(cache).unwrap();
                    continue;
                }
                None => {}
            }

            cache.insert(path.clone(), CacheSlot::Loading);
            drop(cache);

            let result = load_static_file(&path, ctx);

            cache = self.cache.lock().unwrap();
            match &result {
                Ok(generator) => {
                    cache.insert(
                        path.clone(),
                        CacheSlot::Ready(std::sync::Arc::downgrade(&generator.inner)),
                    );
                }
                Err(_) => {
                    cache.remove(&path);
                }
            }
            self.loading.notify_all();
            return result.map(Some);
        }
    }
}

impl Provider for FileProvider {
    fn schemes(&self) -> &[&str] {
        &["file", "stream"]
    }

    fn resolve(&self, uri: &Uri, ctx: &ProviderContext) -> Result<Option<Generator>> {
        let Some(path) = self.locate(&uri.path) else {
            log::debug!("no file found for '{}'", uri);
            return Ok(None);
        };
        match uri.scheme.as_str() {
            "stream" => {
                let decoder = SymphoniaDecoder::open(&path)?;
                Ok(Some(ctx.streaming_generator(Box::new(decoder))))
            }
            _ => self.cached_static(path, ctx),
        }
    }
}

fn load_static_file(path: &Path, ctx: &ProviderContext) -> Result<Generator> {
    let mut decoder = SymphoniaDecoder::open(path)?;
    let format = decoder.format();
    let samples = decode_all(&mut decoder)?;
    log::debug!(
        "decoded {:?}: {} frames at {} Hz",
        path,
        samples.len() / format.channels.max(1) as usize,
        format.sample_rate
    );
    Ok(ctx.static_generator(samples, format))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JobQueue;
    use std::sync::Arc;

    #[test]
    fn test_uri_parsing() {
        let uri = Uri::parse("sfx/boom.ogg", "file");
        assert_eq!(uri.scheme, "file");
        assert_eq!(uri.path, "sfx/boom.ogg");
        assert!(!uri.explicit_scheme);
        assert_eq!(uri.to_string(), "file:///sfx/boom.ogg");

        let uri = Uri::parse("stream:///music/theme.ogg", "file");
        assert_eq!(uri.scheme, "stream");
        assert_eq!(uri.path, "music/theme.ogg");
        assert!(uri.explicit_scheme);

        let uri = Uri::parse("FILE:sfx/a.wav", "stream");
        assert_eq!(uri.scheme, "file");

        let uri = Uri::parse("\\sfx\\boom.ogg", "file");
        assert_eq!(uri.path, "sfx/boom.ogg");

        // A colon inside an invalid scheme prefix keeps the input a path.
        let uri = Uri::parse("dir with space:x", "file");
        assert!(!uri.explicit_scheme);
        assert_eq!(uri.path, "dir with space:x");
    }

    struct RecordingProvider {
        schemes: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl RecordingProvider {
        fn new(schemes: Vec<&'static str>) -> Self {
            Self {
                schemes,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Provider for RecordingProvider {
        fn schemes(&self) -> &[&str] {
            &self.schemes
        }

        fn resolve(&self, uri: &Uri, _ctx: &ProviderContext) -> Result<Option<Generator>> {
            self.seen.lock().unwrap().push(uri.to_string());
            Ok(None)
        }
    }

    fn resolver() -> Resolver {
        let (jobs, _queue) = JobQueue::channel();
        Resolver::new(ProviderContext::new(jobs, 4, 1024), "file")
    }

    #[test]
    fn test_default_scheme_dispatch() {
        let resolver = resolver();
        let provider = Arc::new(RecordingProvider::new(vec!["file"]));
        resolver.register(provider.clone());

        let result = resolver.resolve("sfx/boom.ogg").unwrap();
        assert!(result.is_none());
        assert_eq!(
            provider.seen.lock().unwrap().as_slice(),
            &["file:///sfx/boom.ogg".to_string()]
        );
    }

    #[test]
    fn test_unknown_scheme() {
        let resolver = resolver();
        // Explicit unknown scheme fails fast.
        assert!(matches!(
            resolver.resolve("tape:reel1"),
            Err(SonaraError::Unsupported(_))
        ));
        // A bare path with no default provider is just a miss.
        assert!(resolver.resolve("sfx/boom.ogg").unwrap().is_none());
    }

    #[test]
    fn test_last_registration_wins() {
        let resolver = resolver();
        let first = Arc::new(RecordingProvider::new(vec!["file"]));
        let second = Arc::new(RecordingProvider::new(vec!["FILE"]));
        resolver.register(first.clone());
        resolver.register(second.clone());

        resolver.resolve("a.wav").unwrap();
        assert!(first.seen.lock().unwrap().is_empty());
        assert_eq!(second.seen.lock().unwrap().len(), 1);
    }
}

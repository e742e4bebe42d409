//! Data accessors consumed by the pipeline.
//!
//! A [`LocalSource`] is the fast, possibly stale read (a cache or on-device
//! store). A [`RemoteSource`] is the authoritative, slower read, and it owns
//! the classification of its own errors into [`ErrorKind`]s.

use std::{fmt, future::Future, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use strand_model::ErrorKind;

/// Fast read. `Ok(None)` means "nothing cached". Errors are treated the same
/// as `None` by the pipeline, which only logs them.
#[async_trait]
pub trait LocalSource<T>: Send + Sync {
    /// Read the cached value, if any.
    async fn read(&self) -> anyhow::Result<Option<T>>;
}

/// Authoritative read with a caller-supplied error classifier.
#[async_trait]
pub trait RemoteSource<T>: Send + Sync {
    /// Failure type of [`RemoteSource::fetch`].
    type Error: fmt::Display + Send + Sync + 'static;

    /// One attempt at the authoritative read.
    async fn fetch(&self) -> Result<T, Self::Error>;

    /// Decides whether an error is worth retrying.
    fn classify(&self, error: &Self::Error) -> ErrorKind;
}

#[async_trait]
impl<T, S> LocalSource<T> for Arc<S>
where
    S: LocalSource<T> + ?Sized,
    T: 'static,
{
    async fn read(&self) -> anyhow::Result<Option<T>> {
        (**self).read().await
    }
}

#[async_trait]
impl<T, S> RemoteSource<T> for Arc<S>
where
    S: RemoteSource<T> + ?Sized,
    T: 'static,
{
    type Error = S::Error;

    async fn fetch(&self) -> Result<T, Self::Error> {
        (**self).fetch().await
    }

    fn classify(&self, error: &Self::Error) -> ErrorKind {
        (**self).classify(error)
    }
}

/// A remote failure after classification, as carried between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFailure {
    /// Kind assigned by the source's classifier.
    pub kind: ErrorKind,
    /// Display form of the underlying error.
    pub message: String,
}

impl RemoteFailure {
    /// Failure of `kind` with `message`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} remote failure: {}", self.kind, self.message)
    }
}

/// Local source that never has a value.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLocal;

#[async_trait]
impl<T: Send + 'static> LocalSource<T> for NoLocal {
    async fn read(&self) -> anyhow::Result<Option<T>> {
        Ok(None)
    }
}

/// Adapter returned by [`local_fn`].
pub struct LocalFn<F, T> {
    read: F,
    _value: PhantomData<fn() -> T>,
}

impl<F, T> fmt::Debug for LocalFn<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFn").finish_non_exhaustive()
    }
}

/// Wrap an async closure as a [`LocalSource`].
pub fn local_fn<F, Fut, T>(read: F) -> LocalFn<F, T>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
{
    LocalFn {
        read,
        _value: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> LocalSource<T> for LocalFn<F, T>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    T: Send + 'static,
{
    async fn read(&self) -> anyhow::Result<Option<T>> {
        (self.read)().await
    }
}

/// Adapter returned by [`remote_fn`].
pub struct RemoteFn<F, C, T, E> {
    fetch: F,
    classify: C,
    _value: PhantomData<fn() -> (T, E)>,
}

impl<F, C, T, E> fmt::Debug for RemoteFn<F, C, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFn").finish_non_exhaustive()
    }
}

/// Wrap an async closure and a classifier as a [`RemoteSource`].
pub fn remote_fn<F, Fut, C, T, E>(fetch: F, classify: C) -> RemoteFn<F, C, T, E>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    C: Fn(&E) -> ErrorKind + Send + Sync,
    E: fmt::Display + Send + Sync + 'static,
{
    RemoteFn {
        fetch,
        classify,
        _value: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, C, T, E> RemoteSource<T> for RemoteFn<F, C, T, E>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    C: Fn(&E) -> ErrorKind + Send + Sync,
    T: Send + 'static,
    E: fmt::Display + Send + Sync + 'static,
{
    type Error = E;

    async fn fetch(&self) -> Result<T, E> {
        (self.fetch)().await
    }

    fn classify(&self, error: &E) -> ErrorKind {
        (self.classify)(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_adapt_to_sources() {
        let local = local_fn(|| async { Ok(Some("cached")) });
        assert_eq!(local.read().await.unwrap(), Some("cached"));

        let remote = remote_fn(
            || async { Err::<u32, _>("503 service unavailable".to_string()) },
            |error: &String| {
                if error.starts_with('5') {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            },
        );
        let error = remote.fetch().await.unwrap_err();
        assert_eq!(remote.classify(&error), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn shared_sources_delegate() {
        let remote = Arc::new(remote_fn(
            || async { Ok::<_, String>(5) },
            |_: &String| ErrorKind::Permanent,
        ));
        assert_eq!(RemoteSource::fetch(&remote).await, Ok(5));

        let none: Option<u8> = LocalSource::<u8>::read(&NoLocal).await.unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn remote_failure_display_names_kind() {
        let failure = RemoteFailure::new(ErrorKind::Permanent, "404");
        assert_eq!(failure.to_string(), "permanent remote failure: 404");
    }
}

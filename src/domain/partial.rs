use std::error::Error;
use thiserror::Error;

/// A recovered prefix followed by a failure. The data travels next to it in [`Loaded`].
#[derive(Debug, Error)]
#[error("partial result: {reason} ({parsed_count} items recovered)")]
pub struct PartialResult {
    pub parsed_count: usize,
    pub reason: String,
    #[source]
    pub source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl PartialResult {
    pub fn new(parsed_count: usize, reason: impl Into<String>) -> Self {
        Self {
            parsed_count,
            reason: reason.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// Walks the source chain looking for a [`PartialResult`].
pub fn is_partial(err: &(dyn Error + 'static)) -> bool {
    partial_of(err).is_some()
}

pub fn partial_of<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a PartialResult> {
    let mut current: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(candidate) = current {
        if let Some(partial) = candidate.downcast_ref::<PartialResult>() {
            return Some(partial);
        }
        current = candidate.source();
    }
    None
}

#[derive(Debug)]
pub struct Loaded<T> {
    pub data: T,
    pub partial: Option<PartialResult>,
}

impl<T> Loaded<T> {
    pub fn complete(data: T) -> Self {
        Self {
            data,
            partial: None,
        }
    }

    pub fn partial(data: T, partial: PartialResult) -> Self {
        Self {
            data,
            partial: Some(partial),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Loaded<U> {
        Loaded {
            data: f(self.data),
            partial: self.partial,
        }
    }
}

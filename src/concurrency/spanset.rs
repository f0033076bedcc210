//! Declared key spans of a request, tagged by access and scope.

use std::fmt;

use crate::kvpb::Span;

/// Keyspace a span lives in: versioned user keys or the range-local
/// keyspace (transaction records, range state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanScope {
    Global,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpanAccess {
    ReadOnly,
    ReadWrite,
}

impl SpanAccess {
    /// Read/read is the only compatible pair.
    #[inline]
    pub fn conflicts(&self, other: SpanAccess) -> bool {
        *self == SpanAccess::ReadWrite || other == SpanAccess::ReadWrite
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DeclaredSpan {
    pub scope: SpanScope,
    pub access: SpanAccess,
    pub span: Span,
}

/// Collection of declared spans.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SpanSet {
    spans: Vec<DeclaredSpan>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, access: SpanAccess, scope: SpanScope, span: Span) {
        self.spans.push(DeclaredSpan {
            scope,
            access,
            span,
        });
    }

    #[inline]
    pub fn add_global(&mut self, access: SpanAccess, span: Span) {
        self.add(access, SpanScope::Global, span);
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeclaredSpan> {
        self.spans.iter()
    }

    /// True if any span of `self` conflicts with any span of `other`.
    pub fn conflicts_with(&self, other: &SpanSet) -> bool {
        self.spans.iter().any(|a| {
            other.spans.iter().any(|b| {
                a.scope == b.scope
                    && a.access.conflicts(b.access)
                    && a.span.overlaps(&b.span)
            })
        })
    }

    /// True if the set declares `span` with at least `access`.
    pub fn covers(&self, access: SpanAccess, scope: SpanScope, span: &Span) -> bool {
        self.spans.iter().any(|d| {
            d.scope == scope && d.access >= access && d.span.contains_span(span)
        })
    }

    /// Spans of the given scope and access.
    pub fn spans_of(
        &self,
        scope: SpanScope,
        access: SpanAccess,
    ) -> impl Iterator<Item = &Span> {
        self.spans
            .iter()
            .filter(move |d| d.scope == scope && d.access == access)
            .map(|d| &d.span)
    }
}

impl fmt::Debug for SpanSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.spans.iter().map(|d| {
                format!(
                    "{}{} {:?}",
                    if d.scope == SpanScope::Local { "l" } else { "g" },
                    if d.access == SpanAccess::ReadWrite { "w" } else { "r" },
                    d.span
                )
            }))
            .finish()
    }
}

//! Route shape selection and caching.
//!
//! ```text
//!            select(id)               complete(token, Ok)
//!   Idle ─────────────────> Loading ───────────────────────> Ready
//!    ^                        │  ^                             │
//!    │                        │  └──── select(other id) ───────┤
//!    │                        │ complete(token, Err)           │
//!    │                        v                                │
//!    └──── deselect() ───── Failed <───────────────────────────┘
//! ```
//!
//! Every request carries a token. A completion whose token is not the one
//! currently loading belongs to a superseded selection and is discarded.
//! The displayed polyline only changes on `Ready` or `deselect`, so a failed
//! or slow load never blanks what is on screen.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::error::FetchError;
use crate::models::RouteShape;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeState {
    Idle,
    Loading { token: u64, id: String },
    Ready { id: String },
    Failed { id: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ShapeStatus {
    Idle,
    Loading,
    Ready,
    Failed,
}

/// A fetch the caller must run and feed back through [`RouteShapeCache::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub token: u64,
    pub id: String,
}

/// What the display layer draws for the current selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeView {
    pub status: ShapeStatus,
    pub requested_id: Option<String>,
    pub error: Option<String>,
    pub shape: Option<RouteShape>,
}

impl Default for ShapeView {
    fn default() -> Self {
        Self {
            status: ShapeStatus::Idle,
            requested_id: None,
            error: None,
            shape: None,
        }
    }
}

#[derive(Debug)]
pub struct RouteShapeCache {
    state: ShapeState,
    next_token: u64,
    shapes: HashMap<String, RouteShape>,
    /// Least recently used first.
    recency: VecDeque<String>,
    capacity: usize,
    displayed: Option<String>,
}

impl RouteShapeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: ShapeState::Idle,
            next_token: 0,
            shapes: HashMap::new(),
            recency: VecDeque::new(),
            capacity: capacity.max(1),
            displayed: None,
        }
    }

    pub fn state(&self) -> &ShapeState {
        &self.state
    }

    /// Select a shape id. Returns a request when it has to be fetched.
    pub fn select(&mut self, id: &str) -> Option<ShapeRequest> {
        if self.shapes.contains_key(id) {
            self.touch(id);
            self.state = ShapeState::Ready { id: id.to_string() };
            self.displayed = Some(id.to_string());
            tracing::debug!(shape_id = %id, "Shape served from cache");
            return None;
        }

        if let ShapeState::Loading { id: loading, .. } = &self.state {
            if loading == id {
                return None;
            }
        }

        self.next_token += 1;
        let request = ShapeRequest {
            token: self.next_token,
            id: id.to_string(),
        };
        self.state = ShapeState::Loading {
            token: request.token,
            id: request.id.clone(),
        };
        Some(request)
    }

    /// Apply a finished fetch. Returns false if the token was superseded.
    pub fn complete(&mut self, token: u64, result: Result<RouteShape, FetchError>) -> bool {
        let id = match &self.state {
            ShapeState::Loading { token: current, id } if *current == token => id.clone(),
            _ => {
                tracing::debug!(token, "Discarding superseded shape response");
                return false;
            }
        };

        match result {
            Ok(shape) => {
                self.displayed = Some(id.clone());
                self.insert(id.clone(), shape);
                self.state = ShapeState::Ready { id };
            }
            Err(e) => {
                tracing::warn!(shape_id = %id, error = %e, "Shape fetch failed");
                self.state = ShapeState::Failed {
                    id,
                    error: e.to_string(),
                };
            }
        }
        true
    }

    /// Clear the selection and evict the shape that was on screen.
    pub fn deselect(&mut self) {
        if let Some(id) = self.displayed.take() {
            self.shapes.remove(&id);
            self.recency.retain(|cached| *cached != id);
        }
        self.state = ShapeState::Idle;
    }

    pub fn view(&self) -> ShapeView {
        let (status, requested_id, error) = match &self.state {
            ShapeState::Idle => (ShapeStatus::Idle, None, None),
            ShapeState::Loading { id, .. } => (ShapeStatus::Loading, Some(id.clone()), None),
            ShapeState::Ready { id } => (ShapeStatus::Ready, Some(id.clone()), None),
            ShapeState::Failed { id, error } => (ShapeStatus::Failed, Some(id.clone()), Some(error.clone())),
        };

        ShapeView {
            status,
            requested_id,
            error,
            shape: self.displayed.as_ref().and_then(|id| self.shapes.get(id)).cloned(),
        }
    }

    pub fn cached(&self) -> usize {
        self.shapes.len()
    }

    fn insert(&mut self, id: String, shape: RouteShape) {
        self.shapes.insert(id.clone(), shape);
        self.touch(&id);

        while self.shapes.len() > self.capacity {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            // Never evict what is on screen
            if self.displayed.as_deref() == Some(oldest.as_str()) {
                self.recency.push_back(oldest);
                if self.recency.len() == 1 {
                    break;
                }
                continue;
            }
            self.shapes.remove(&oldest);
        }
    }

    fn touch(&mut self, id: &str) {
        self.recency.retain(|cached| cached != id);
        self.recency.push_back(id.to_string());
    }
}

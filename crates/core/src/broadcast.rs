//! Fans sparse render updates out to independent renderers.
//!
//! Renderers decide relevance from the field names alone and only report
//! whether they need a redraw. Redraws are coalesced: however many updates
//! arrive between paint ticks, each dirty renderer draws once per tick.

use gobanview_protocol::{FieldSet, RenderState};

pub trait Renderer: Send {
    fn name(&self) -> &str;

    /// Absorbs whatever `state` carries that this renderer displays.
    /// Returns true when the next paint should redraw it.
    fn update(&mut self, fields: &FieldSet, state: &RenderState) -> bool;

    fn draw(&mut self);
}

#[derive(Default)]
pub struct Broadcaster {
    renderers: Vec<Box<dyn Renderer>>,
    dirty: Vec<bool>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, renderer: Box<dyn Renderer>) {
        self.renderers.push(renderer);
        self.dirty.push(false);
    }

    pub fn len(&self) -> usize {
        self.renderers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renderers.is_empty()
    }

    /// Offers `state` to every renderer. Returns whether any of them changed.
    pub fn broadcast(&mut self, state: &RenderState) -> bool {
        if state.is_empty() {
            return false;
        }
        let fields = state.fields();
        let mut changed = false;
        for (renderer, dirty) in self.renderers.iter_mut().zip(self.dirty.iter_mut()) {
            if renderer.update(&fields, state) {
                *dirty = true;
                changed = true;
            }
        }
        changed
    }

    pub fn has_pending(&self) -> bool {
        self.dirty.iter().any(|d| *d)
    }

    /// One paint tick: draws each dirty renderer exactly once. Returns the
    /// number of renderers drawn.
    pub fn paint(&mut self) -> usize {
        let mut drawn = 0;
        for (renderer, dirty) in self.renderers.iter_mut().zip(self.dirty.iter_mut()) {
            if std::mem::take(dirty) {
                renderer.draw();
                drawn += 1;
            }
        }
        drawn
    }
}

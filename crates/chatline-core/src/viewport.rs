//! Visible slice of the message sequence.
//!
//! The window tracks which indices a renderer should show, which ones keep
//! their rendered content, and reports only what changed between
//! recomputations.

use std::ops::Range;

use serde::Deserialize;
use tracing::trace;

/// Viewport settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Estimated row height in pixels.
    pub item_height_estimate: f64,
    /// Extra rows kept below the visible area.
    pub buffer_size: usize,
    /// Upper bound on rows holding rendered content.
    pub max_rendered: usize,
    /// Rows farther than this from the window lose their content.
    pub unload_distance: usize,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            item_height_estimate: 48.0,
            buffer_size: 5,
            max_rendered: 500,
            unload_distance: 100,
        }
    }
}

impl ViewportConfig {
    #[must_use]
    pub fn with_item_height(mut self, height: f64) -> Self {
        self.item_height_estimate = height;
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, buffer: usize) -> Self {
        self.buffer_size = buffer;
        self
    }

    #[must_use]
    pub fn with_max_rendered(mut self, max: usize) -> Self {
        self.max_rendered = max;
        self
    }

    #[must_use]
    pub fn with_unload_distance(mut self, distance: usize) -> Self {
        self.unload_distance = distance;
        self
    }

    fn item_height(&self) -> f64 {
        if self.item_height_estimate.is_finite() && self.item_height_estimate > 0.0 {
            self.item_height_estimate
        } else {
            1.0
        }
    }
}

/// Re-render request produced when the window moves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderDelta {
    pub start: usize,
    pub end: usize,
    /// Indices that became visible.
    pub entered: Vec<Range<usize>>,
    /// Indices that stopped being visible.
    pub exited: Vec<Range<usize>>,
    /// Indices whose content should be swapped for placeholders.
    pub unloaded: Vec<Range<usize>>,
}

impl RenderDelta {
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.exited.is_empty() && self.unloaded.is_empty()
    }
}

/// Tracks the rendered slice of the message sequence.
///
/// Indices refer to the store's current sequence. When the store evicts,
/// [`ViewportWindow::sync`] shifts everything so the same messages stay in
/// view.
#[derive(Debug, Clone)]
pub struct ViewportWindow {
    config: ViewportConfig,
    scroll_top: f64,
    container_height: f64,
    total: usize,
    evicted_total: u64,
    visible: Range<usize>,
    rendered: Range<usize>,
    follow_tail: bool,
}

impl ViewportWindow {
    pub fn new(config: ViewportConfig) -> Self {
        Self {
            config,
            scroll_top: 0.0,
            container_height: 0.0,
            total: 0,
            evicted_total: 0,
            visible: 0..0,
            rendered: 0..0,
            follow_tail: true,
        }
    }

    pub fn config(&self) -> &ViewportConfig {
        &self.config
    }

    /// Current `(start, end)` of the visible slice.
    pub fn visible_slice(&self) -> (usize, usize) {
        (self.visible.start, self.visible.end)
    }

    /// Rows currently holding rendered content.
    pub fn rendered_range(&self) -> Range<usize> {
        self.rendered.clone()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    /// Whether the window sticks to the newest message.
    pub fn is_following_tail(&self) -> bool {
        self.follow_tail
    }

    /// Height of the whole sequence at the estimated row height.
    pub fn content_height(&self) -> f64 {
        self.total as f64 * self.config.item_height()
    }

    /// User scrolled. Scrolling to the bottom re-enables tail following.
    pub fn on_scroll(&mut self, scroll_top: f64, container_height: f64) -> Option<RenderDelta> {
        self.scroll_top = scroll_top.max(0.0);
        self.container_height = container_height.max(0.0);
        let slack = self.config.item_height() / 2.0;
        self.follow_tail = self.scroll_top + self.container_height >= self.content_height() - slack;
        self.recompute()
    }

    pub fn on_resize(&mut self, container_height: f64) -> Option<RenderDelta> {
        self.container_height = container_height.max(0.0);
        self.recompute()
    }

    /// Brings the window in line with the store after it changed.
    ///
    /// `evicted_total` is the store's running eviction count; the difference
    /// from the last sync is how far indices shift down.
    pub fn sync(&mut self, total: usize, evicted_total: u64) -> Option<RenderDelta> {
        let shift = usize::try_from(evicted_total.saturating_sub(self.evicted_total))
            .unwrap_or(usize::MAX);
        self.evicted_total = evicted_total;
        if shift > 0 {
            self.visible = shift_range(&self.visible, shift);
            self.rendered = shift_range(&self.rendered, shift);
            if !self.follow_tail {
                self.scroll_top =
                    (self.scroll_top - shift as f64 * self.config.item_height()).max(0.0);
            }
        }
        self.total = total;
        self.rendered = clamp_range(&self.rendered, total);
        self.visible = clamp_range(&self.visible, total);
        self.recompute()
    }

    fn compute_visible(&self) -> Range<usize> {
        let h = self.config.item_height();
        let start = ((self.scroll_top / h).floor() as usize).min(self.total);
        let rows = (self.container_height / h).ceil() as usize;
        let end = start
            .saturating_add(rows)
            .saturating_add(self.config.buffer_size)
            .min(self.total);
        start..end
    }

    fn recompute(&mut self) -> Option<RenderDelta> {
        if self.follow_tail {
            self.scroll_top = (self.content_height() - self.container_height).max(0.0);
        }

        let old_visible = self.visible.clone();
        let new_visible = self.compute_visible();
        let old_rendered = self.rendered.clone();
        let new_rendered = self.next_rendered(&new_visible);

        let delta = RenderDelta {
            start: new_visible.start,
            end: new_visible.end,
            entered: subtract(&new_visible, &old_visible),
            exited: subtract(&old_visible, &new_visible),
            unloaded: subtract(&old_rendered, &new_rendered),
        };

        self.visible = new_visible;
        self.rendered = new_rendered;

        if delta.is_empty() {
            return None;
        }
        trace!(
            start = delta.start,
            end = delta.end,
            rendered = ?self.rendered,
            "Viewport changed"
        );
        Some(delta)
    }

    /// Rendered rows after the window moves to `visible`.
    fn next_rendered(&self, visible: &Range<usize>) -> Range<usize> {
        let old = &self.rendered;
        let joined = if old.is_empty() || old.end < visible.start || visible.end < old.start {
            // A jump past the loaded rows starts a fresh region.
            visible.clone()
        } else {
            old.start.min(visible.start)..old.end.max(visible.end)
        };

        let keep_start = visible.start.saturating_sub(self.config.unload_distance);
        let keep_end = visible
            .end
            .saturating_add(self.config.unload_distance)
            .min(self.total);
        let mut rendered = joined.start.max(keep_start)..joined.end.min(keep_end);

        let len = rendered.len();
        if len > self.config.max_rendered {
            let mut excess = len - self.config.max_rendered;
            let mut before = visible.start - rendered.start;
            let mut after = rendered.end - visible.end;

            let first = excess.min(before.abs_diff(after));
            if before > after {
                before -= first;
            } else {
                after -= first;
            }
            excess -= first;

            let trim_after = (excess / 2).min(after);
            let trim_before = (excess - trim_after).min(before);
            before -= trim_before;
            after -= trim_after;

            rendered = visible.start - before..visible.end + after;
        }
        rendered
    }
}

fn shift_range(range: &Range<usize>, shift: usize) -> Range<usize> {
    range.start.saturating_sub(shift)..range.end.saturating_sub(shift)
}

fn clamp_range(range: &Range<usize>, total: usize) -> Range<usize> {
    let end = range.end.min(total);
    range.start.min(end)..end
}

/// Parts of `a` not covered by `b`.
fn subtract(a: &Range<usize>, b: &Range<usize>) -> Vec<Range<usize>> {
    if a.is_empty() {
        return Vec::new();
    }
    if b.is_empty() || b.end <= a.start || a.end <= b.start {
        return vec![a.clone()];
    }
    let mut out = Vec::with_capacity(2);
    if a.start < b.start {
        out.push(a.start..b.start);
    }
    if b.end < a.end {
        out.push(b.end..a.end);
    }
    out
}

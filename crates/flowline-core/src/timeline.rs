//! Pure time <-> pixel mapping for the scrolling timeline.
//!
//! The viewport is centered on `current_time + view_offset`; one hour spans
//! `PIXELS_PER_HOUR_BASE * zoom_factor` pixels. `time_to_x` and `x_to_time`
//! are exact algebraic inverses up to floating-point rounding.

use chrono::{Duration, NaiveDateTime};

pub const PIXELS_PER_HOUR_BASE: f64 = 120.0;
pub const MIN_ZOOM: f64 = 0.2;
pub const MAX_ZOOM: f64 = 5.0;
pub const ZOOM_STEP: f64 = 1.5;

const SECS_PER_HOUR: f64 = 3600.0;
const MICROS_PER_SEC: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    current_time: NaiveDateTime,
    view_offset_secs: f64,
    zoom_factor: f64,
    container_width: f64,
}

impl Viewport {
    pub fn new(current_time: NaiveDateTime, container_width: f64) -> Self {
        Self {
            current_time,
            view_offset_secs: 0.0,
            zoom_factor: 1.0,
            container_width,
        }
    }

    pub fn current_time(&self) -> NaiveDateTime {
        self.current_time
    }

    pub fn view_offset_secs(&self) -> f64 {
        self.view_offset_secs
    }

    pub fn zoom_factor(&self) -> f64 {
        self.zoom_factor
    }

    pub fn container_width(&self) -> f64 {
        self.container_width
    }

    fn pixels_per_second(&self) -> f64 {
        PIXELS_PER_HOUR_BASE * self.zoom_factor / SECS_PER_HOUR
    }

    fn center_time(&self) -> NaiveDateTime {
        offset_instant(self.current_time, self.view_offset_secs)
    }

    pub fn time_to_x(&self, t: NaiveDateTime) -> f64 {
        let delta_secs = seconds_between(self.center_time(), t);
        self.container_width / 2.0 + delta_secs * self.pixels_per_second()
    }

    pub fn x_to_time(&self, x: f64) -> NaiveDateTime {
        let delta_secs = (x - self.container_width / 2.0) / self.pixels_per_second();
        offset_instant(self.center_time(), delta_secs)
    }

    /// Instants covered by `0..=container_width`, for culling off-screen tasks.
    pub fn visible_range(&self) -> (NaiveDateTime, NaiveDateTime) {
        (self.x_to_time(0.0), self.x_to_time(self.container_width))
    }

    pub fn zoom_in(&mut self) {
        self.set_zoom(self.zoom_factor * ZOOM_STEP);
    }

    pub fn zoom_out(&mut self) {
        self.set_zoom(self.zoom_factor / ZOOM_STEP);
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom_factor = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
    }

    pub fn pan_by_secs(&mut self, delta_secs: f64) {
        self.view_offset_secs += delta_secs;
    }

    pub fn jump_to_now(&mut self, now: NaiveDateTime) {
        self.view_offset_secs = 0.0;
        self.current_time = now;
    }

    /// The periodic server tick is the only writer of `current_time`
    /// (besides an explicit jump-to-now).
    pub fn advance_to(&mut self, instant: NaiveDateTime) {
        self.current_time = instant;
    }

    pub fn set_container_width(&mut self, width: f64) {
        self.container_width = width;
    }
}

fn seconds_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    let delta = to.signed_duration_since(from);
    match delta.num_microseconds() {
        Some(micros) => micros as f64 / MICROS_PER_SEC,
        None => delta.num_seconds() as f64,
    }
}

fn offset_instant(base: NaiveDateTime, delta_secs: f64) -> NaiveDateTime {
    base + Duration::microseconds((delta_secs * MICROS_PER_SEC).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn instant(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .expect("valid date")
            .and_hms_opt(h, m, 0)
            .expect("valid time")
    }

    fn assert_close(a: NaiveDateTime, b: NaiveDateTime) {
        let delta = (a.signed_duration_since(b)).num_milliseconds().abs();
        assert!(delta <= 1, "instants differ by {delta}ms: {a} vs {b}");
    }

    #[test]
    fn now_sits_at_container_center_with_zero_offset() {
        let view = Viewport::new(instant(12, 0), 1000.0);
        assert_eq!(view.time_to_x(instant(12, 0)), 500.0);
    }

    #[test]
    fn one_hour_spans_the_base_pixel_width_at_default_zoom() {
        let view = Viewport::new(instant(12, 0), 1000.0);
        let x = view.time_to_x(instant(13, 0));
        assert!((x - (500.0 + PIXELS_PER_HOUR_BASE)).abs() < 1e-9);
    }

    #[test]
    fn x_to_time_inverts_time_to_x_across_zoom_offset_and_width() {
        let targets = [instant(0, 30), instant(9, 0), instant(12, 0), instant(23, 45)];
        for zoom in [MIN_ZOOM, 0.5, 1.0, 2.25, MAX_ZOOM] {
            for offset_secs in [-7200.0, -90.5, 0.0, 42.25, 5400.0] {
                for width in [320.0, 1000.0, 2560.0] {
                    let mut view = Viewport::new(instant(12, 0), width);
                    view.set_zoom(zoom);
                    view.pan_by_secs(offset_secs);
                    for t in targets {
                        assert_close(view.x_to_time(view.time_to_x(t)), t);
                    }
                }
            }
        }
    }

    #[test]
    fn zoom_multiplies_by_step_and_clamps() {
        let mut view = Viewport::new(instant(12, 0), 1000.0);
        view.zoom_in();
        assert!((view.zoom_factor() - ZOOM_STEP).abs() < 1e-9);
        for _ in 0..10 {
            view.zoom_in();
        }
        assert_eq!(view.zoom_factor(), MAX_ZOOM);
        for _ in 0..20 {
            view.zoom_out();
        }
        assert_eq!(view.zoom_factor(), MIN_ZOOM);
    }

    #[test]
    fn jump_to_now_resets_offset() {
        let mut view = Viewport::new(instant(12, 0), 1000.0);
        view.pan_by_secs(3600.0);
        view.jump_to_now(instant(14, 0));
        assert_eq!(view.view_offset_secs(), 0.0);
        assert_eq!(view.current_time(), instant(14, 0));
        assert_eq!(view.time_to_x(instant(14, 0)), 500.0);
    }

    #[test]
    fn tick_advances_current_time_without_touching_zoom_or_offset() {
        let mut view = Viewport::new(instant(12, 0), 1000.0);
        view.set_zoom(2.0);
        view.pan_by_secs(600.0);
        view.advance_to(instant(12, 1));
        assert_eq!(view.current_time(), instant(12, 1));
        assert_eq!(view.zoom_factor(), 2.0);
        assert_eq!(view.view_offset_secs(), 600.0);
    }

    #[test]
    fn visible_range_brackets_the_center() {
        let view = Viewport::new(instant(12, 0), 1000.0);
        let (earliest, latest) = view.visible_range();
        assert!(earliest < instant(12, 0));
        assert!(latest > instant(12, 0));
        // 1000px at 120px/h covers 8h20m centered on now.
        assert_close(earliest, instant(12, 0) - Duration::seconds(15_000));
        assert_close(latest, instant(12, 0) + Duration::seconds(15_000));
    }
}

//! chart rendering for alert annotations.
//!
//! the renderer is a black box to the dispatcher: give it a sensor, a time
//! window and an optional annotation, get back a file reference or `None`
//! when the window holds no data.

use crate::domain::{SensorId, SensorReading, TimeRange};
use crate::store::ReadingStore;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// reference to a rendered chart on disk
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChartImage {
    pub sensor_id: SensorId,
    pub path: PathBuf,
}

pub trait ChartRenderer: Send + Sync {
    fn render(&self, sensor: SensorId, range: TimeRange, annotation: Option<&str>) -> Result<Option<ChartImage>>;
}

const WIDTH: f64 = 1000.0;
const HEIGHT: f64 = 500.0;
const PAD: f64 = 60.0;
const WRAP: usize = 30;

fn color(sensor: SensorId) -> &'static str {
    match sensor {
        SensorId::IndoorTemp => "red",
        SensorId::Humidity => "blue",
        SensorId::ThermalFlow => "green",
    }
}

/// writes `<dir>/<sensor>_alert_graph.svg` (or `_graph.svg` without annotation)
pub struct SvgChartRenderer {
    store: Arc<ReadingStore>,
    dir: PathBuf,
}

impl SvgChartRenderer {
    pub fn new(store: Arc<ReadingStore>, dir: impl Into<PathBuf>) -> Self {
        Self { store, dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ChartRenderer for SvgChartRenderer {
    fn render(&self, sensor: SensorId, range: TimeRange, annotation: Option<&str>) -> Result<Option<ChartImage>> {
        let readings = self.store.range(sensor, range)?;
        if readings.is_empty() {
            tracing::info!(sensor = %sensor, "[CHART] No data in window, skipping chart");
            return Ok(None);
        }

        let svg = render_svg(sensor, &readings, annotation);
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create chart dir {}", self.dir.display()))?;
        let name = match annotation {
            Some(_) => format!("{}_alert_graph.svg", sensor.as_str()),
            None => format!("{}_graph.svg", sensor.as_str()),
        };
        let path = self.dir.join(name);
        std::fs::write(&path, svg).with_context(|| format!("failed to write {}", path.display()))?;

        tracing::info!(sensor = %sensor, path = %path.display(), points = readings.len(), "[CHART] Saved");
        Ok(Some(ChartImage { sensor_id: sensor, path }))
    }
}

/// greedy word wrap for the annotation box
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    for word in text.split_whitespace() {
        if !line.is_empty() && line.chars().count() + 1 + word.chars().count() > width {
            lines.push(std::mem::take(&mut line));
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(word);
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

pub fn render_svg(sensor: SensorId, readings: &[SensorReading], annotation: Option<&str>) -> String {
    let finite: Vec<f64> = readings.iter().map(|r| r.value).filter(|v| v.is_finite()).collect();
    let (mut lo, mut hi) = finite
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if !lo.is_finite() {
        (lo, hi) = (0.0, 1.0);
    }
    if (hi - lo).abs() < f64::EPSILON {
        lo -= 1.0;
        hi += 1.0;
    }

    let t0 = readings.first().map(|r| r.timestamp.timestamp_millis()).unwrap_or(0);
    let t1 = readings.last().map(|r| r.timestamp.timestamp_millis()).unwrap_or(0);
    let span = (t1 - t0).max(1) as f64;

    let x = |ts: i64| PAD + (ts - t0) as f64 / span * (WIDTH - 2.0 * PAD);
    let y = |v: f64| HEIGHT - PAD - (v - lo) / (hi - lo) * (HEIGHT - 2.0 * PAD);

    let points: Vec<(f64, f64)> = readings
        .iter()
        .filter(|r| r.value.is_finite())
        .map(|r| (x(r.timestamp.timestamp_millis()), y(r.value)))
        .collect();

    let title = match annotation {
        Some(_) => format!("{} readings with detected spike", sensor.label()),
        None => format!("{} readings", sensor.label()),
    };

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" font-family="sans-serif">"#
    );
    let _ = writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#);
    let _ = writeln!(svg, r#"<text x="{}" y="30" text-anchor="middle" font-size="18">{}</text>"#, WIDTH / 2.0, escape(&title));
    let _ = writeln!(
        svg,
        r#"<line x1="{PAD}" y1="{b}" x2="{r}" y2="{b}" stroke="black"/><line x1="{PAD}" y1="{PAD}" x2="{PAD}" y2="{b}" stroke="black"/>"#,
        b = HEIGHT - PAD,
        r = WIDTH - PAD
    );
    let _ = writeln!(
        svg,
        r#"<text x="{PAD}" y="{}" font-size="12">{}</text><text x="{}" y="{}" font-size="12" text-anchor="end">{}</text>"#,
        HEIGHT - PAD + 20.0,
        readings.first().map(|r| r.timestamp.format("%Y-%m-%d %H:%M").to_string()).unwrap_or_default(),
        WIDTH - PAD,
        HEIGHT - PAD + 20.0,
        readings.last().map(|r| r.timestamp.format("%Y-%m-%d %H:%M").to_string()).unwrap_or_default(),
    );
    let _ = writeln!(
        svg,
        r#"<text x="5" y="{}" font-size="12">{hi:.1}{u}</text><text x="5" y="{}" font-size="12">{lo:.1}{u}</text>"#,
        PAD,
        HEIGHT - PAD,
        u = escape(sensor.unit())
    );

    let polyline: Vec<String> = points.iter().map(|(px, py)| format!("{px:.1},{py:.1}")).collect();
    let _ = writeln!(
        svg,
        r#"<polyline fill="none" stroke="{}" stroke-width="2" points="{}"/>"#,
        color(sensor),
        polyline.join(" ")
    );
    for (px, py) in &points {
        let _ = writeln!(svg, r#"<circle cx="{px:.1}" cy="{py:.1}" r="3" fill="{}"/>"#, color(sensor));
    }

    if let (Some(text), Some((px, py))) = (annotation, points.last()) {
        let lines = wrap_text(text, WRAP);
        let tx = (px - 150.0).max(PAD + 10.0);
        let ty = (py - 20.0 - 16.0 * lines.len() as f64).max(PAD);
        let _ = writeln!(
            svg,
            r#"<line x1="{tx:.1}" y1="{:.1}" x2="{px:.1}" y2="{py:.1}" stroke="red" stroke-width="1.5"/>"#,
            ty + 16.0 * lines.len() as f64
        );
        for (i, line) in lines.iter().enumerate() {
            let _ = writeln!(
                svg,
                r#"<text x="{tx:.1}" y="{:.1}" fill="red" font-size="14">{}</text>"#,
                ty + 16.0 * i as f64,
                escape(line)
            );
        }
    }

    svg.push_str("</svg>\n");
    svg
}

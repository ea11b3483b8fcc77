//! SVG training-curve charts
//!
//! Plain SVG line charts for the per-epoch loss and accuracy history, so a
//! run's log directory can be inspected with nothing but a browser.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

pub const TRAIN_STROKE: &str = "#1f77b4";
pub const VALID_STROKE: &str = "#d62728";

const FONT: &str = "Helvetica, Arial, sans-serif";
const INK: &str = "#333333";
const GRID: &str = "#e5e5e5";
const Y_TICKS: usize = 4;

/// A named series of (x, y) points
#[derive(Debug, Clone)]
pub struct DataSeries {
    pub name: String,
    pub points: Vec<(f64, f64)>,
    pub color: String,
}

impl DataSeries {
    /// Series indexed by epoch number (1-based)
    pub fn per_epoch(name: &str, values: &[f64], color: &str) -> Self {
        Self {
            name: name.to_string(),
            points: values
                .iter()
                .enumerate()
                .map(|(i, &v)| ((i + 1) as f64, v))
                .collect(),
            color: color.to_string(),
        }
    }
}

/// Canvas size and plot-area insets in pixels
#[derive(Debug, Clone, Copy)]
struct Layout {
    width: f64,
    height: f64,
    left: f64,
    right: f64,
    top: f64,
    bottom: f64,
}

impl Layout {
    const DEFAULT: Layout = Layout {
        width: 720.0,
        height: 440.0,
        left: 70.0,
        right: 30.0,
        top: 50.0,
        bottom: 60.0,
    };

    fn plot_w(&self) -> f64 {
        self.width - self.left - self.right
    }

    fn plot_h(&self) -> f64 {
        self.height - self.top - self.bottom
    }

    fn baseline(&self) -> f64 {
        self.top + self.plot_h()
    }
}

/// Data extent over the finite points of every series
#[derive(Debug, Clone, Copy, PartialEq)]
struct Extent {
    x: (f64, f64),
    y: (f64, f64),
}

impl Extent {
    fn of(series: &[DataSeries]) -> Self {
        let finite = series
            .iter()
            .flat_map(|s| s.points.iter().copied())
            .filter(|(_, y)| y.is_finite());

        let mut extent: Option<Extent> = None;
        for (x, y) in finite {
            extent = Some(match extent {
                None => Extent { x: (x, x), y: (y, y) },
                Some(e) => Extent {
                    x: (e.x.0.min(x), e.x.1.max(x)),
                    y: (e.y.0.min(y), e.y.1.max(y)),
                },
            });
        }

        let mut extent = extent.unwrap_or(Extent {
            x: (0.0, 1.0),
            y: (0.0, 1.0),
        });
        if extent.x.1 <= extent.x.0 {
            extent.x.1 = extent.x.0 + 1.0;
        }
        // losses are unbounded so pad the observed range rather than fixing it
        let pad = ((extent.y.1 - extent.y.0) * 0.05).max(1e-6);
        extent.y = ((extent.y.0 - pad).max(0.0).min(extent.y.0), extent.y.1 + pad);
        extent
    }
}

fn text(svg: &mut String, x: f64, y: f64, size: u32, anchor: &str, extra: &str, body: &str) {
    let _ = write!(
        svg,
        r#"<text x="{x:.1}" y="{y:.1}" font-family="{FONT}" font-size="{size}" fill="{INK}" text-anchor="{anchor}"{extra}>{}</text>"#,
        escape_xml(body)
    );
}

fn segment(svg: &mut String, from: (f64, f64), to: (f64, f64), stroke: &str, width: f64) {
    let _ = write!(
        svg,
        r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{stroke}" stroke-width="{width}"/>"#,
        from.0, from.1, to.0, to.1
    );
}

/// Render a line chart to an SVG string
pub fn render_line_chart(title: &str, x_label: &str, y_label: &str, series: &[DataSeries]) -> String {
    let l = Layout::DEFAULT;
    let e = Extent::of(series);

    let px = |x: f64| l.left + (x - e.x.0) / (e.x.1 - e.x.0) * l.plot_w();
    let py = |y: f64| l.baseline() - (y - e.y.0) / (e.y.1 - e.y.0) * l.plot_h();

    let mut svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}"><rect width="100%" height="100%" fill="#ffffff"/>"##,
        w = l.width,
        h = l.height
    );
    text(&mut svg, l.width / 2.0, l.top / 2.0 + 6.0, 16, "middle", r#" font-weight="bold""#, title);

    for tick in 0..=Y_TICKS {
        let value = e.y.0 + (e.y.1 - e.y.0) * tick as f64 / Y_TICKS as f64;
        let y = py(value);
        segment(&mut svg, (l.left, y), (l.left + l.plot_w(), y), GRID, 1.0);
        text(&mut svg, l.left - 8.0, y + 4.0, 11, "end", "", &format!("{:.3}", value));
    }

    segment(&mut svg, (l.left, l.baseline()), (l.left + l.plot_w(), l.baseline()), INK, 1.5);
    segment(&mut svg, (l.left, l.top), (l.left, l.baseline()), INK, 1.5);

    text(&mut svg, l.left + l.plot_w() / 2.0, l.height - 18.0, 13, "middle", "", x_label);
    let mid = l.top + l.plot_h() / 2.0;
    let rotate = format!(r#" transform="rotate(-90 18 {:.1})""#, mid);
    text(&mut svg, 18.0, mid, 13, "middle", &rotate, y_label);

    for (row, data) in series.iter().enumerate() {
        let path = data
            .points
            .iter()
            .filter(|(_, y)| y.is_finite())
            .enumerate()
            .map(|(i, &(x, y))| format!("{}{:.2},{:.2}", if i == 0 { 'M' } else { 'L' }, px(x), py(y)))
            .collect::<Vec<_>>()
            .join(" ");
        if !path.is_empty() {
            let _ = write!(
                svg,
                r#"<path d="{path}" fill="none" stroke="{}" stroke-width="2"/>"#,
                data.color
            );
        }

        let key_x = l.width - l.right - 110.0;
        let key_y = l.top + 8.0 + row as f64 * 20.0;
        segment(&mut svg, (key_x, key_y), (key_x + 18.0, key_y), &data.color, 3.0);
        text(&mut svg, key_x + 24.0, key_y + 4.0, 11, "start", "", &data.name);
    }

    svg.push_str("</svg>");
    svg
}

/// Render and write a line chart SVG
pub fn write_line_chart(
    title: &str,
    x_label: &str,
    y_label: &str,
    series: &[DataSeries],
    output_path: &Path,
) -> std::io::Result<()> {
    fs::write(output_path, render_line_chart(title, x_label, y_label, series))
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_chart_contains_both_series() {
        let series = vec![
            DataSeries::per_epoch("loss", &[0.7, 0.5, 0.4], TRAIN_STROKE),
            DataSeries::per_epoch("val_loss", &[0.8, 0.6, 0.55], VALID_STROKE),
        ];
        let svg = render_line_chart("Loss", "Epoch", "BCE", &series);

        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("val_loss"));
        assert_eq!(svg.matches("<path").count(), 2);
    }

    #[test]
    fn test_nan_points_are_skipped() {
        let series = vec![DataSeries::per_epoch("val_loss", &[f64::NAN, f64::NAN], VALID_STROKE)];
        let svg = render_line_chart("Loss", "Epoch", "BCE", &series);
        assert_eq!(svg.matches("<path").count(), 0);
        assert!(!svg.contains("NaN"));
    }

    #[test]
    fn test_extent_pads_and_floors_at_zero() {
        let series = vec![DataSeries::per_epoch("acc", &[0.0, 1.0], TRAIN_STROKE)];
        let extent = Extent::of(&series);
        assert_eq!(extent.x, (1.0, 2.0));
        assert_eq!(extent.y.0, 0.0);
        assert!(extent.y.1 > 1.0);
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a<b & \"c\""), "a&lt;b &amp; &quot;c&quot;");
    }

    #[test]
    fn test_write_line_chart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curve.svg");
        let series = vec![DataSeries::per_epoch("loss", &[1.0], TRAIN_STROKE)];
        write_line_chart("Loss", "Epoch", "BCE", &series, &path).unwrap();
        assert!(path.exists());
    }
}

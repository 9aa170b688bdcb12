//! PNG rendering of training curves, confusion matrices, PR/ROC curves and the
//! technique comparison chart.

use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use std::path::Path;

use crate::history::History;
use crate::metrics::{ClassCurves, ConfusionMatrix};

fn plot_err<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> anyhow::Error {
    move |e| anyhow::anyhow!("{what}: {e}")
}

fn series_color(idx: usize) -> RGBAColor {
    Palette99::pick(idx).to_rgba()
}

fn value_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.05).max(1e-3);
    (lo - pad, hi + pad)
}

/// Accuracy (left) and loss (right) for training and validation per epoch.
pub fn plot_history(history: &History, path: &Path) -> anyhow::Result<()> {
    let root = BitMapBackend::new(path, (1200, 500)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err("backend error"))?;
    let panels = root.split_evenly((1, 2));
    let epochs: Vec<f64> = history.epochs().iter().map(|e| *e as f64).collect();
    let x_max = epochs.last().copied().unwrap_or(1.0).max(1.0);

    let specs: [(&str, &str, [(&str, &[f64]); 2]); 2] = [
        (
            "Accuracy",
            "accuracy",
            [
                ("training accuracy", history.accuracy()),
                ("validation accuracy", history.val_accuracy()),
            ],
        ),
        (
            "Loss",
            "loss",
            [
                ("training loss", history.loss()),
                ("validation loss", history.val_loss()),
            ],
        ),
    ];

    for (area, (title, y_desc, series)) in panels.iter().zip(specs) {
        let (y_lo, y_hi) = value_range(series.iter().flat_map(|(_, s)| s.iter().copied()));
        let mut chart = ChartBuilder::on(area)
            .caption(title, ("sans-serif", 22))
            .margin(12)
            .x_label_area_size(40)
            .y_label_area_size(55)
            .build_cartesian_2d(0f64..x_max, y_lo..y_hi)
            .map_err(plot_err("chart build error"))?;
        chart
            .configure_mesh()
            .x_desc("epochs")
            .y_desc(y_desc)
            .draw()
            .map_err(plot_err("mesh error"))?;
        for (idx, (label, values)) in series.iter().enumerate() {
            let color = series_color(idx);
            let points = epochs
                .iter()
                .zip(values.iter())
                .filter(|(_, v)| v.is_finite())
                .map(|(e, v)| (*e, *v));
            chart
                .draw_series(LineSeries::new(points, color.stroke_width(2)))
                .map_err(plot_err("draw error"))?
                .label(*label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(plot_err("legend error"))?;
    }
    root.present().map_err(plot_err("render error"))?;
    Ok(())
}

fn heat_color(t: f64) -> RGBColor {
    let t = t.clamp(0.0, 1.0);
    let lerp = |a: f64, b: f64| (a + (b - a) * t).round() as u8;
    RGBColor(lerp(247.0, 8.0), lerp(251.0, 48.0), lerp(255.0, 107.0))
}

/// Heatmap of counts with the true class on rows and the prediction on columns.
pub fn plot_confusion_matrix<S: AsRef<str>>(
    cm: &ConfusionMatrix,
    class_names: &[S],
    title: &str,
    path: &Path,
) -> anyhow::Result<()> {
    let n = cm.classes();
    if class_names.len() != n {
        anyhow::bail!(
            "confusion matrix has {n} classes but {} names were given",
            class_names.len()
        );
    }
    let root = BitMapBackend::new(path, (800, 650)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err("backend error"))?;

    let size = n.max(1) as f64;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(120)
        .build_cartesian_2d(0f64..size, 0f64..size)
        .map_err(plot_err("chart build error"))?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("predicted")
        .y_desc("true")
        .x_label_formatter(&|_| String::new())
        .y_label_formatter(&|_| String::new())
        .draw()
        .map_err(plot_err("mesh error"))?;

    let max = cm.max_count().max(1) as f64;
    for truth in 0..n {
        // Row 0 at the top.
        let y0 = (n - 1 - truth) as f64;
        for pred in 0..n {
            let count = cm.get(truth, pred);
            let shade = count as f64 / max;
            let x0 = pred as f64;
            chart
                .draw_series(std::iter::once(Rectangle::new(
                    [(x0, y0), (x0 + 1.0, y0 + 1.0)],
                    heat_color(shade).filled(),
                )))
                .map_err(plot_err("draw error"))?;
            let text_color = if shade > 0.5 { WHITE } else { BLACK };
            let style = ("sans-serif", 22)
                .into_font()
                .color(&text_color)
                .pos(Pos::new(HPos::Center, VPos::Center));
            let at = chart.backend_coord(&(x0 + 0.5, y0 + 0.5));
            root.draw(&Text::new(count.to_string(), at, style))
                .map_err(plot_err("draw error"))?;
        }
    }

    let label_style = ("sans-serif", 15).into_font().color(&BLACK);
    for (idx, name) in class_names.iter().enumerate() {
        let (x, y) = chart.backend_coord(&(idx as f64 + 0.5, 0.0));
        root.draw(&Text::new(
            name.as_ref().to_string(),
            (x, y + 8),
            label_style.pos(Pos::new(HPos::Center, VPos::Top)),
        ))
        .map_err(plot_err("draw error"))?;
        let (x, y) = chart.backend_coord(&(0.0, (n - 1 - idx) as f64 + 0.5));
        root.draw(&Text::new(
            name.as_ref().to_string(),
            (x - 8, y),
            label_style.pos(Pos::new(HPos::Right, VPos::Center)),
        ))
        .map_err(plot_err("draw error"))?;
    }
    root.present().map_err(plot_err("render error"))?;
    Ok(())
}

/// Per-class PR curves (left) and ROC curves (right) on one canvas.
pub fn plot_pr_roc(curves: &[ClassCurves], path: &Path) -> anyhow::Result<()> {
    let root = BitMapBackend::new(path, (1200, 500)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err("backend error"))?;
    let panels = root.split_evenly((1, 2));

    for (panel, area) in panels.iter().enumerate() {
        let (title, x_desc, y_desc) = if panel == 0 {
            ("Precision-Recall", "recall", "precision")
        } else {
            ("ROC", "false positive rate", "true positive rate")
        };
        let mut chart = ChartBuilder::on(area)
            .caption(title, ("sans-serif", 22))
            .margin(12)
            .x_label_area_size(40)
            .y_label_area_size(55)
            .build_cartesian_2d(0f64..1.0, 0f64..1.02)
            .map_err(plot_err("chart build error"))?;
        chart
            .configure_mesh()
            .x_desc(x_desc)
            .y_desc(y_desc)
            .draw()
            .map_err(plot_err("mesh error"))?;

        for (idx, class) in curves.iter().enumerate() {
            let color = series_color(idx);
            let (xs, ys, area_under) = if panel == 0 {
                (&class.pr.recall, &class.pr.precision, class.pr_auc)
            } else {
                (&class.roc.fpr, &class.roc.tpr, class.roc_auc)
            };
            let points: Vec<(f64, f64)> = xs
                .iter()
                .zip(ys.iter())
                .filter(|(x, y)| x.is_finite() && y.is_finite())
                .map(|(x, y)| (*x, *y))
                .collect();
            chart
                .draw_series(LineSeries::new(points, color.stroke_width(2)))
                .map_err(plot_err("draw error"))?
                .label(format!("{} (AUC {area_under:.3})", class.name))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }
        if panel == 1 {
            chart
                .draw_series(LineSeries::new(
                    vec![(0.0, 0.0), (1.0, 1.0)],
                    BLACK.mix(0.3).stroke_width(1),
                ))
                .map_err(plot_err("draw error"))?;
        }
        chart
            .configure_series_labels()
            .position(if panel == 0 {
                SeriesLabelPosition::LowerLeft
            } else {
                SeriesLabelPosition::LowerRight
            })
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(plot_err("legend error"))?;
    }
    root.present().map_err(plot_err("render error"))?;
    Ok(())
}

/// Published scores of crowd-density techniques (accuracy, precision, recall, F1).
pub const TECHNIQUE_SCORES: [(&str, [f64; 4]); 8] = [
    ("Gabor", [0.78, 0.76, 0.77, 0.76]),
    ("BoW-SRP", [0.80, 0.78, 0.79, 0.78]),
    ("BoW-LBP", [0.81, 0.79, 0.80, 0.79]),
    ("GLCM-SVM", [0.82, 0.81, 0.82, 0.80]),
    ("GoogleNet", [0.85, 0.84, 0.83, 0.85]),
    ("VGGNet", [0.87, 0.85, 0.86, 0.87]),
    ("MDTL-ICDDC", [0.88, 0.86, 0.87, 0.88]),
    ("AICDA-SSC", [0.90, 0.89, 0.91, 0.92]),
];

const SCORE_NAMES: [&str; 4] = ["accuracy", "precision", "recall", "F1-score"];

/// Grouped bar chart of [`TECHNIQUE_SCORES`].
pub fn plot_technique_comparison(path: &Path) -> anyhow::Result<()> {
    let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err("backend error"))?;

    let groups = TECHNIQUE_SCORES.len() as f64;
    let mut chart = ChartBuilder::on(&root)
        .caption("AICDA-SSC compared with other techniques", ("sans-serif", 26))
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(55)
        .build_cartesian_2d(0f64..groups, 0f64..1.0)
        .map_err(plot_err("chart build error"))?;
    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_desc("technique")
        .x_label_formatter(&|_| String::new())
        .draw()
        .map_err(plot_err("mesh error"))?;

    let width = 0.2;
    for (metric, metric_name) in SCORE_NAMES.iter().enumerate() {
        let color = series_color(metric);
        let offset = 0.1 + width * metric as f64;
        let bars = TECHNIQUE_SCORES.iter().enumerate().map(|(g, (_, scores))| {
            let x0 = g as f64 + offset;
            Rectangle::new([(x0, 0.0), (x0 + width, scores[metric])], color.filled())
        });
        chart
            .draw_series(bars)
            .map_err(plot_err("draw error"))?
            .label(*metric_name)
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 15, y + 5)], color.filled()));
    }

    let label_style = ("sans-serif", 15)
        .into_font()
        .color(&BLACK)
        .pos(Pos::new(HPos::Center, VPos::Top));
    for (g, (name, _)) in TECHNIQUE_SCORES.iter().enumerate() {
        let (x, y) = chart.backend_coord(&(g as f64 + 0.5, 0.0));
        root.draw(&Text::new(name.to_string(), (x, y + 8), label_style.clone()))
            .map_err(plot_err("draw error"))?;
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plot_err("legend error"))?;
    root.present().map_err(plot_err("render error"))?;
    Ok(())
}

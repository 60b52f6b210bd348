use crate::vectorizer::{ConversionResult, Dot, PathSegment, PathStyle, Point, Primitive, VectorPath};
use rgb::RGBA8;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Serializes a conversion result into a standalone SVG document.
///
/// Output depends only on `result` and `precision`.
pub fn generate_svg(result: &ConversionResult, precision: u8) -> String {
    let mut svg = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    svg.push('\n');
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" version="1.1" width="{}" height="{}" viewBox="0 0 {} {}">"#,
        result.width, result.height, result.width, result.height
    ));
    svg.push('\n');

    for primitive in &result.primitives {
        let element = match primitive {
            Primitive::Path(path) => path_element(path, precision),
            Primitive::Region(region) => path_element(&region.boundary, precision),
            Primitive::Dot(dot) => Some(dot_element(dot, precision)),
        };
        if let Some(element) = element {
            svg.push_str("  ");
            svg.push_str(&element);
            svg.push('\n');
        }
    }

    svg.push_str("</svg>\n");
    svg
}

pub fn write_svg(result: &ConversionResult, precision: u8, output_path: &Path) -> std::io::Result<()> {
    let mut file = File::create(output_path)?;
    file.write_all(generate_svg(result, precision).as_bytes())?;
    Ok(())
}

fn path_element(path: &VectorPath, precision: u8) -> Option<String> {
    let d = path_data(path, precision);
    if d.is_empty() {
        return None;
    }
    Some(format!(r#"<path d="{}"{}/>"#, d, style_attributes(&path.style, precision)))
}

fn dot_element(dot: &Dot, precision: u8) -> String {
    let mut element = match dot.outline() {
        None => format!(
            r#"<circle cx="{}" cy="{}" r="{}" fill="{}""#,
            fmt_num(dot.center.x, precision),
            fmt_num(dot.center.y, precision),
            fmt_num(dot.radius, precision),
            hex_color(dot.color)
        ),
        Some(vertices) => {
            let d: Vec<String> = vertices
                .iter()
                .enumerate()
                .map(|(i, &p)| format!("{}{}", if i == 0 { "M" } else { "L" }, fmt_point(p, precision)))
                .collect();
            format!(r#"<path d="{} Z" fill="{}""#, d.join(" "), hex_color(dot.color))
        }
    };
    if dot.color.a < 255 {
        element.push_str(&format!(r#" fill-opacity="{}""#, opacity(dot.color)));
    }
    element.push_str("/>");
    element
}

/// Absolute `M`/`L`/`C` commands, with `Z` for closed paths.
pub fn path_data(path: &VectorPath, precision: u8) -> String {
    let Some(start) = path.start() else {
        return String::new();
    };
    let mut d = format!("M{}", fmt_point(start, precision));
    for segment in &path.segments {
        match *segment {
            PathSegment::Line { to, .. } => {
                d.push_str(&format!(" L{}", fmt_point(to, precision)));
            }
            PathSegment::Cubic { ctrl1, ctrl2, to, .. } => {
                d.push_str(&format!(
                    " C{} {} {}",
                    fmt_point(ctrl1, precision),
                    fmt_point(ctrl2, precision),
                    fmt_point(to, precision)
                ));
            }
        }
    }
    if path.closed {
        d.push_str(" Z");
    }
    d
}

fn style_attributes(style: &PathStyle, precision: u8) -> String {
    let mut attrs = String::new();
    match style.fill {
        Some(color) => {
            attrs.push_str(&format!(r#" fill="{}""#, hex_color(color)));
            if color.a < 255 {
                attrs.push_str(&format!(r#" fill-opacity="{}""#, opacity(color)));
            }
        }
        None => attrs.push_str(r#" fill="none""#),
    }
    match style.stroke {
        Some(color) if style.stroke_width > 0.0 => {
            attrs.push_str(&format!(
                r#" stroke="{}" stroke-width="{}""#,
                hex_color(color),
                fmt_num(style.stroke_width, precision)
            ));
            if color.a < 255 {
                attrs.push_str(&format!(r#" stroke-opacity="{}""#, opacity(color)));
            }
            if style.fill.is_none() {
                attrs.push_str(r#" stroke-linecap="round" stroke-linejoin="round""#);
            }
        }
        _ => {}
    }
    attrs
}

fn fmt_point(p: Point, precision: u8) -> String {
    format!("{} {}", fmt_num(p.x, precision), fmt_num(p.y, precision))
}

/// Rounds to `precision` decimals, trims trailing zeros and normalizes `-0`.
pub fn fmt_num(v: f64, precision: u8) -> String {
    if !v.is_finite() {
        return "0".to_string();
    }
    let mut s = format!("{:.*}", precision as usize, v);
    if s.contains('.') {
        let trimmed = s.trim_end_matches('0').trim_end_matches('.').len();
        s.truncate(trimmed);
    }
    if s == "-0" {
        s = "0".to_string();
    }
    s
}

fn hex_color(c: RGBA8) -> String {
    format!("#{:02x}{:02x}{:02x}", c.r, c.g, c.b)
}

fn opacity(c: RGBA8) -> String {
    fmt_num(c.a as f64 / 255.0, 3)
}

#[cfg(test)]
mod tests {
    include!("svg_generator_tests.rs");
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::config::{Backend, DotShape};
    use crate::vectorizer::{ConversionMetadata, Region};
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    fn black() -> RGBA8 {
        RGBA8::new(0, 0, 0, 255)
    }

    fn result_with(primitives: Vec<Primitive>) -> ConversionResult {
        ConversionResult {
            width: 100,
            height: 80,
            metadata: ConversionMetadata {
                elapsed: Duration::from_millis(1),
                primitive_count: primitives.len(),
                backend: Backend::Edge,
                passes: 1,
                threads_used: 1,
            },
            primitives,
        }
    }

    fn stroke(points: &[(f64, f64)], closed: bool) -> VectorPath {
        let points: Vec<Point> = points.iter().map(|&(x, y)| Point::new(x, y)).collect();
        VectorPath::from_polyline(&points, closed, PathStyle::stroked(black(), 1.5)).unwrap()
    }

    /// Element names in document order, as seen by an SVG parser.
    fn element_names(document: &str) -> Vec<String> {
        let mut names = Vec::new();
        for event in svg::read(document).unwrap() {
            if let svg::parser::Event::Tag(name, svg::node::element::tag::Type::Empty, _) = event {
                names.push(name.to_string());
            }
        }
        names
    }

    #[test]
    fn test_fmt_num_trims_and_normalizes() {
        assert_eq!(fmt_num(1.5, 2), "1.5");
        assert_eq!(fmt_num(2.0, 2), "2");
        assert_eq!(fmt_num(3.14159, 3), "3.142");
        assert_eq!(fmt_num(-0.0001, 2), "0");
        assert_eq!(fmt_num(-1.26, 1), "-1.3");
        assert_eq!(fmt_num(10.0, 0), "10");
        assert_eq!(fmt_num(f64::NAN, 2), "0");
    }

    #[test]
    fn test_path_data_lines_and_close() {
        let path = stroke(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)], true);
        assert_eq!(path_data(&path, 2), "M0 0 L10 0 L10 10 Z");
    }

    #[test]
    fn test_path_data_cubic() {
        let path = VectorPath {
            segments: vec![PathSegment::Cubic {
                from: Point::new(0.0, 0.0),
                ctrl1: Point::new(1.234, 5.0),
                ctrl2: Point::new(6.0, 5.0),
                to: Point::new(7.0, 0.0),
            }],
            closed: false,
            style: PathStyle::stroked(black(), 1.0),
        };
        assert_eq!(path_data(&path, 1), "M0 0 C1.2 5 6 5 7 0");
    }

    #[test]
    fn test_document_header_and_elements() {
        let dot = Primitive::Dot(Dot {
            center: Point::new(5.0, 6.0),
            radius: 2.0,
            color: RGBA8::new(255, 0, 0, 255),
            shape: DotShape::Circle,
        });
        let svg = generate_svg(
            &result_with(vec![Primitive::Path(stroke(&[(1.0, 1.0), (20.0, 30.0)], false)), dot]),
            2,
        );
        assert!(svg.starts_with("<?xml"));
        assert!(svg.contains(r#"xmlns="http://www.w3.org/2000/svg""#));
        assert!(svg.contains(r#"viewBox="0 0 100 80""#));
        assert!(svg.contains(r##"fill="none" stroke="#000000""##));
        assert!(svg.contains(r#"stroke-linecap="round""#));
        assert!(svg.contains(r##"<circle cx="5" cy="6" r="2" fill="#ff0000"/>"##));
        assert_eq!(element_names(&svg), vec!["path", "circle"]);
    }

    #[test]
    fn test_shaped_dots_become_closed_paths() {
        let dot = |shape| {
            Primitive::Dot(Dot {
                center: Point::new(10.0, 10.0),
                radius: 2.0,
                color: black(),
                shape,
            })
        };
        let svg = generate_svg(
            &result_with(vec![
                dot(DotShape::Diamond),
                dot(DotShape::Square),
                dot(DotShape::Triangle),
                dot(DotShape::Circle),
            ]),
            2,
        );
        assert!(svg.contains(r##"<path d="M10 8 L12 10 L10 12 L8 10 Z" fill="#000000"/>"##));
        assert_eq!(element_names(&svg), vec!["path", "path", "path", "circle"]);
    }

    #[test]
    fn test_region_fill_and_opacity() {
        let boundary = VectorPath::from_polyline(
            &[Point::new(0.0, 0.0), Point::new(4.0, 0.0), Point::new(4.0, 4.0)],
            true,
            PathStyle::filled(RGBA8::new(0, 128, 255, 128)),
        )
        .unwrap();
        let region = Primitive::Region(Region {
            boundary,
            color: RGBA8::new(0, 128, 255, 128),
            area: 8,
        });
        let svg = generate_svg(&result_with(vec![region]), 2);
        assert!(svg.contains(r##"fill="#0080ff" fill-opacity="0.502""##));
        assert!(!svg.contains("stroke="));
    }

    #[test]
    fn test_empty_result_is_valid_document() {
        let svg = generate_svg(&result_with(Vec::new()), 2);
        assert!(element_names(&svg).is_empty());
        assert!(svg.trim_end().ends_with("</svg>"));
    }

    #[test]
    fn test_output_is_deterministic() {
        let result = result_with(vec![Primitive::Path(stroke(&[(0.123, 4.567), (8.9, 1.0)], false))]);
        assert_eq!(generate_svg(&result, 3), generate_svg(&result, 3));
    }

    #[test]
    fn test_write_svg_to_file() {
        let result = result_with(vec![Primitive::Path(stroke(&[(0.0, 0.0), (5.0, 5.0)], false))]);
        let output_path: PathBuf = std::env::temp_dir().join("trace2svg_write_test.svg");
        write_svg(&result, 2, &output_path).unwrap();
        let content = fs::read_to_string(&output_path).unwrap();
        assert_eq!(content, generate_svg(&result, 2));
        fs::remove_file(&output_path).ok();
    }
}

use prettytable::{cell, row, Table};

use crate::evaluate::EvalResult;

/// `Index | Class name | AP` table, one row per evaluated class.
pub fn ap_table(result: &EvalResult, class_names: &[String]) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Index", "Class name", "AP"]);
    for (class, ap) in result.per_class.classes.iter().zip(&result.per_class.ap) {
        let name = class_names
            .get(*class)
            .cloned()
            .unwrap_or_else(|| format!("class_{class}"));
        table.add_row(row![class, name, format!("{ap:.5}")]);
    }
    table
}

pub fn render_report(result: &EvalResult, class_names: &[String]) -> String {
    format!(
        "{}---- mAP {}",
        ap_table(result, class_names),
        result.means().map
    )
}

/// One-line mean precision / recall / F1 over the evaluated classes.
pub fn summary_line(result: &EvalResult) -> String {
    let means = result.means();
    format!(
        "precision {:.4} recall {:.4} f1 {:.4}",
        means.precision, means.recall, means.f1
    )
}

pub fn print_report(result: &EvalResult, class_names: &[String]) {
    ap_table(result, class_names).printstd();
    println!("---- mAP {}", result.means().map);
    log::info!("{}", summary_line(result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ApPerClass;

    #[test]
    fn table_lists_classes_and_map() {
        let result = EvalResult {
            per_class: ApPerClass {
                precision: vec![1.0, 0.5],
                recall: vec![1.0, 0.5],
                ap: vec![1.0, 0.25],
                f1: vec![1.0, 0.5],
                classes: vec![0, 2],
            },
            ..EvalResult::default()
        };
        let names = vec!["Car".to_string(), "Pedestrian".to_string(), "Cyclist".to_string()];
        let text = render_report(&result, &names);
        assert!(text.contains("Class name"));
        assert!(text.contains("Cyclist"));
        assert!(text.contains("0.25000"));
        assert!(!text.contains("Pedestrian"));
        assert!(text.ends_with("---- mAP 0.625"));
        assert_eq!(summary_line(&result), "precision 0.7500 recall 0.7500 f1 0.7500");
    }
}

//! Merge refinement outputs into one labeled block for the synthesizer.

use crate::gateway::{CompletionResponse, Part};

/// Header that introduces refinement `index` (1-based).
pub fn refined_response_header(index: usize) -> String {
    format!("--- Refined Response {index} ---")
}

/// Label each refinement by its position and concatenate them.
///
/// A refinement with no content still contributes its header.
pub fn aggregate(results: &[CompletionResponse]) -> Vec<Part> {
    let capacity = results.iter().map(|r| r.parts.len() + 1).sum();
    let mut parts = Vec::with_capacity(capacity);
    for (i, resp) in results.iter().enumerate() {
        parts.push(Part::text(refined_response_header(i + 1)));
        parts.extend(resp.parts.iter().cloned());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::parts_text;

    #[test]
    fn test_two_refinements_read_in_order() {
        let parts = aggregate(&[
            CompletionResponse::from_text("R1"),
            CompletionResponse::from_text("R2"),
        ]);
        assert_eq!(
            parts_text(&parts, "\n"),
            "--- Refined Response 1 ---\nR1\n--- Refined Response 2 ---\nR2"
        );
    }

    #[test]
    fn test_empty_refinement_keeps_its_header() {
        let parts = aggregate(&[
            CompletionResponse::from_text("R1"),
            CompletionResponse::empty(),
            CompletionResponse::from_text("R3"),
        ]);
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[2], Part::text("--- Refined Response 2 ---"));
        assert_eq!(parts[3], Part::text("--- Refined Response 3 ---"));
    }

    #[test]
    fn test_multi_part_and_binary_content_pass_through() {
        let parts = aggregate(&[CompletionResponse::from_parts(vec![
            Part::text("see chart"),
            Part::inline("image/png", "AAAA"),
        ])]);
        assert_eq!(
            parts,
            vec![
                Part::text("--- Refined Response 1 ---"),
                Part::text("see chart"),
                Part::inline("image/png", "AAAA"),
            ]
        );
    }

    #[test]
    fn test_no_refinements_yield_nothing() {
        assert!(aggregate(&[]).is_empty());
    }
}

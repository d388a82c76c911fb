//! Property-based tests for the verification pipeline using proptest.
//!
//! These tests check the structural guarantees the loop relies on:
//!
//! - Located spans are valid slices of the response text
//! - Regions are ordered, disjoint, and escalate when too many or too large
//! - Rewriting never loses content below the minimum output length
//! - The loop's best score never regresses and iterations stay bounded

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::hallucination::feedback::{FeedbackConfig, FeedbackLoop};
    use crate::hallucination::grouper::SectionGrouper;
    use crate::hallucination::locator::ClaimLocator;
    use crate::hallucination::progress::ProgressReporter;
    use crate::hallucination::rewriter::{with_disclaimer, RewriterConfig, SectionRewriter};
    use crate::hallucination::test_support::{original_section, ScriptedEvaluator, ScriptedGenerator};
    use crate::hallucination::types::{Claim, EvaluationResult, RewriteRegion, VerificationRequest};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn document(paragraphs: usize) -> String {
        (0..paragraphs)
            .map(|i| format!("Paragraph marker{:02} {}", i, "lorem ipsum ".repeat(50)))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    // =========================================================================
    // Locating
    // =========================================================================

    proptest! {
        /// Every located span is an in-bounds slice on char boundaries.
        #[test]
        fn located_spans_are_valid_slices(
            text in "[a-zA-Zé .,\n]{0,300}",
            claim in "[a-zA-Z .]{1,60}"
        ) {
            let located = ClaimLocator::new().locate(&text, &[Claim::new(claim, "r")]);
            for span in located {
                prop_assert!(span.end() <= text.len());
                prop_assert!(text.is_char_boundary(span.start_index));
                prop_assert!(text.is_char_boundary(span.end()));
            }
        }

        /// An exact substring is found at an exact match's position.
        #[test]
        fn exact_substrings_are_found(
            prefix in "[a-z ]{0,80}",
            claim in "[A-Z][a-z]{3,10}( [a-z]{3,10}){2,6}",
            suffix in "[a-z ]{0,80}"
        ) {
            let text = format!("{}{}{}", prefix, claim, suffix);
            let located = ClaimLocator::new().locate(&text, &[Claim::new(claim.clone(), "r")]);
            prop_assert_eq!(located.len(), 1);
            let span = &located[0];
            prop_assert_eq!(&text[span.start_index..span.end()], claim.as_str());
        }
    }

    // =========================================================================
    // Grouping
    // =========================================================================

    proptest! {
        /// Regions are ordered and disjoint; anything that would exceed the
        /// limits collapses into one whole-document region.
        #[test]
        fn regions_are_disjoint_or_escalated(
            flags in prop::collection::vec(any::<bool>(), 1..16)
        ) {
            let text = document(flags.len());
            let claims: Vec<Claim> = flags
                .iter()
                .enumerate()
                .filter(|(_, flagged)| **flagged)
                .map(|(i, _)| Claim::new(format!("marker{:02}", i), "r"))
                .collect();
            let located = ClaimLocator::new().locate(&text, &claims);
            let grouper = SectionGrouper::default();
            let regions = grouper.group(&text, &located, &claims);

            prop_assert!(!regions.is_empty());
            if regions.len() == 1 && regions[0].covers(text.len()) {
                return Ok(());
            }

            let config = grouper.config();
            prop_assert!(regions.len() <= config.max_regions);
            let covered: usize = regions.iter().map(RewriteRegion::len).sum();
            prop_assert!(covered as f64 <= config.max_coverage * text.len() as f64);
            for pair in regions.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start);
            }
            for span in &located {
                prop_assert!(regions
                    .iter()
                    .any(|r| r.start <= span.start_index && span.end() <= r.end));
            }
        }
    }

    // =========================================================================
    // Rewriting
    // =========================================================================

    proptest! {
        /// The disclaimer keeps the original text and is never too short.
        #[test]
        fn disclaimer_preserves_content(text in ".{0,200}") {
            let marked = with_disclaimer(&text);
            prop_assert!(marked.starts_with(&text));
            prop_assert!(marked.chars().count() >= 20);
            prop_assert_eq!(with_disclaimer(&marked), marked.clone());
        }

        /// With every generator call failing, rewriting still returns at
        /// least the minimum output length.
        #[test]
        fn exhausted_rewrites_never_drop_content(
            text in "[A-Za-z][a-z ]{0,120}",
            claim_len in 1usize..20
        ) {
            let claim_text: String = text.chars().take(claim_len).collect();
            let region = RewriteRegion::whole_document(
                &text,
                vec![Claim::new(claim_text, "unsupported")],
                Vec::new(),
            );
            let rewriter = SectionRewriter::new(
                Arc::new(ScriptedGenerator::failing()),
                RewriterConfig::default(),
            );

            let rewrite = runtime().block_on(rewriter.rewrite(&text, &region, "grounding", "query"));
            prop_assert!(rewrite.text.chars().count() >= 20);
        }
    }

    // =========================================================================
    // Feedback loop
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// The returned score is the best one evaluated, never below the
        /// initial score, and the iteration count stays within budget.
        #[test]
        fn best_score_never_regresses(
            scores in prop::collection::vec(0.0f64..1.0, 1..8),
            max_iterations in 0u32..6,
            target in 0.5f64..1.0
        ) {
            let calls = AtomicUsize::new(0);
            let script = scores.clone();
            let evaluator = Arc::new(ScriptedEvaluator::new(move |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(EvaluationResult::new(script[n % script.len()], "scripted")
                    .with_claim(Claim::new(format!("claim {}", n), "unsupported")))
            }));
            let revisions = AtomicUsize::new(0);
            let generator = Arc::new(ScriptedGenerator::new(move |call| {
                let n = revisions.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{} Revision {}.", original_section(&call.user).unwrap_or_default(), n))
            }));
            let feedback = FeedbackLoop::new(
                evaluator,
                generator,
                FeedbackConfig::default()
                    .with_max_iterations(max_iterations)
                    .with_target_score(target),
            );
            let request = VerificationRequest::new(
                "What are containers?",
                "Containers bundle an application with its dependencies into one image.",
                "Containers share the host kernel.",
            );

            let result = runtime()
                .block_on(feedback.improve(&request, &ProgressReporter::none()))
                .unwrap();

            prop_assert!(result.iterations <= max_iterations);
            prop_assert!(result.final_score >= result.initial_score);
            let best = result.metrics.iter().map(|m| m.score).fold(f64::MIN, f64::max);
            prop_assert_eq!(result.final_score, best);
            prop_assert_eq!(result.metrics[0].score, scores[0]);
            if result.verification_passed {
                prop_assert!(result.final_score >= target);
            }
        }
    }
}

// src/engine/assembly.rs

use std::collections::HashSet;

use rand::{
    Rng,
    seq::{IndexedRandom, SliceRandom},
};

use super::QuizEngine;
use crate::{
    error::AppError,
    models::{
        question::{Question, QuestionKind, TestCase},
        quiz::QuestionPaper,
    },
};

/// Orders the questions of one attempt.
///
/// The fixed segment comes first, in its recorded order (else insertion
/// order), permuted only when the paper shuffles questions. Each pool then
/// contributes a fresh sample of `num_questions` active members. A pool
/// smaller than requested contributes what it has; ids already placed are not
/// repeated.
pub fn assemble_order<R: Rng + ?Sized>(
    paper: &QuestionPaper,
    inactive: &HashSet<i64>,
    rng: &mut R,
) -> Vec<i64> {
    let mut order = fixed_order(paper);
    if paper.shuffle_questions {
        order.shuffle(rng);
    }

    let mut placed: HashSet<i64> = order.iter().copied().collect();
    for set in &paper.question_sets {
        let candidates: Vec<i64> = set
            .questions
            .iter()
            .copied()
            .filter(|id| !inactive.contains(id) && !placed.contains(id))
            .collect();

        let wanted = usize::try_from(set.num_questions).unwrap_or(0);
        for id in candidates.choose_multiple(rng, wanted) {
            placed.insert(*id);
            order.push(*id);
        }
    }

    order
}

fn fixed_order(paper: &QuestionPaper) -> Vec<i64> {
    match &paper.fixed_question_order {
        Some(recorded) if !recorded.is_empty() => {
            // Ids no longer among the fixed questions are dropped; fixed
            // questions missing from the record keep their insertion order.
            let mut order: Vec<i64> = recorded
                .iter()
                .copied()
                .filter(|id| paper.fixed_questions.contains(id))
                .collect();
            for id in &paper.fixed_questions {
                if !order.contains(id) {
                    order.push(*id);
                }
            }
            order
        }
        _ => paper.fixed_questions.clone(),
    }
}

/// Σ fixed question points + Σ over pools of (marks × num_questions).
pub fn total_marks(paper: &QuestionPaper, fixed: &[Question]) -> f64 {
    let fixed_points: f64 = paper
        .fixed_questions
        .iter()
        .filter_map(|id| fixed.iter().find(|q| q.id == *id))
        .map(|q| q.points)
        .sum();

    let pooled: f64 = paper
        .question_sets
        .iter()
        .map(|set| set.marks * f64::from(set.num_questions))
        .sum();

    fixed_points + pooled
}

/// A random presentation order for the options of `kind`, or `None` when the
/// options are shown in authoring order.
pub fn shuffled_options<R: Rng + ?Sized>(
    kind: QuestionKind,
    shuffle_testcases: bool,
    test_cases: &[TestCase],
    rng: &mut R,
) -> Option<Vec<i64>> {
    let randomized = match kind {
        QuestionKind::Arrange => true,
        QuestionKind::Mcq | QuestionKind::Mcc => shuffle_testcases,
        _ => false,
    };
    if !randomized {
        return None;
    }

    let mut ids: Vec<i64> = test_cases
        .iter()
        .filter(|tc| tc.as_option().is_some())
        .map(|tc| tc.id)
        .collect();
    ids.shuffle(rng);
    Some(ids)
}

impl QuizEngine {
    /// Draws the ordered question list for a new attempt at `paper`.
    pub async fn assemble(&self, paper: &QuestionPaper) -> Result<Vec<i64>, AppError> {
        let pooled: Vec<i64> = paper
            .question_sets
            .iter()
            .flat_map(|set| set.questions.iter().copied())
            .collect();

        let inactive: HashSet<i64> = self
            .store
            .get_questions(&pooled)
            .await?
            .into_iter()
            .filter(|q| !q.active)
            .map(|q| q.id)
            .collect();

        Ok(assemble_order(paper, &inactive, &mut rand::rng()))
    }

    /// Recomputes and stores the paper's total marks. Must be called after
    /// the fixed questions or pools change; nothing else keeps it current.
    pub async fn update_total_marks(&self, question_paper_id: i64) -> Result<f64, AppError> {
        let paper = self
            .store
            .get_question_paper(question_paper_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Question paper {} not found", question_paper_id))
            })?;

        let fixed = self.store.get_questions(&paper.fixed_questions).await?;
        let total = total_marks(&paper, &fixed);
        self.store.set_total_marks(question_paper_id, total).await?;

        tracing::info!("Question paper {} total marks set to {}", question_paper_id, total);
        Ok(total)
    }
}

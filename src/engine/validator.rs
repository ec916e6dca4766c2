// src/engine/validator.rs

use std::collections::BTreeSet;

use serde::Serialize;

use crate::{
    error::AppError,
    executor::JobPayload,
    models::{
        answer_paper::{AnswerGrade, SubmittedValue},
        question::{Question, QuestionKind, StringCheck, TestCase, TestCaseKind},
    },
};

pub const CORRECT: &str = "Correct answer";
pub const INCORRECT: &str = "Incorrect answer";

/// Outcome of checking one submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    /// Whether the sequencer may move past the question.
    pub accepted: bool,
    pub success: bool,
    pub marks: f64,
    pub detail: Vec<String>,
}

impl Verdict {
    /// Verdict for kinds graded in-process. Such answers always advance the
    /// sequencer, right or wrong.
    fn graded(question: &Question, success: bool) -> Self {
        Self {
            accepted: true,
            success,
            marks: if success { question.points } else { 0.0 },
            detail: vec![if success { CORRECT } else { INCORRECT }.to_string()],
        }
    }

    /// Grading columns to store on the answer row.
    pub fn to_grade(&self) -> AnswerGrade {
        AnswerGrade {
            correct: self.success,
            marks: self.marks,
            error: if self.success { Vec::new() } else { self.detail.clone() },
        }
    }
}

/// What to do with a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Verdict(Verdict),
    /// Correctness is decided by the code runner.
    Dispatch(JobPayload),
}

/// Checks `value` against the test cases of `question`.
///
/// A value of the wrong shape for the question kind is a bad request, not a
/// wrong answer.
pub fn check(
    question: &Question,
    test_cases: &[TestCase],
    value: &SubmittedValue,
) -> Result<Check, AppError> {
    let mismatch = || {
        AppError::BadRequest(format!(
            "Answer does not fit a {} question",
            question.kind
        ))
    };

    let success = match question.kind {
        QuestionKind::Mcq => {
            let SubmittedValue::Choice(choice) = value else {
                return Err(mismatch());
            };
            let correct = correct_options(test_cases);
            correct.len() == 1 && correct.contains(choice)
        }
        QuestionKind::Mcc => {
            let SubmittedValue::Choices(choices) = value else {
                return Err(mismatch());
            };
            let chosen: BTreeSet<i64> = choices.iter().copied().collect();
            chosen == correct_options(test_cases)
        }
        QuestionKind::Integer => {
            let SubmittedValue::Integer(given) = value else {
                return Err(mismatch());
            };
            test_cases
                .iter()
                .any(|tc| matches!(&tc.data.0, TestCaseKind::Integer { correct } if correct == given))
        }
        QuestionKind::Float => {
            let given = match value {
                SubmittedValue::Float(v) => *v,
                SubmittedValue::Integer(v) => *v as f64,
                _ => return Err(mismatch()),
            };
            test_cases.iter().any(|tc| match &tc.data.0 {
                TestCaseKind::Float {
                    correct,
                    error_margin,
                } => (correct - given).abs() <= *error_margin,
                _ => false,
            })
        }
        QuestionKind::String => {
            let SubmittedValue::Text(given) = value else {
                return Err(mismatch());
            };
            test_cases.iter().any(|tc| match &tc.data.0 {
                TestCaseKind::String {
                    correct,
                    string_check,
                } => strings_match(correct, given, *string_check),
                _ => false,
            })
        }
        QuestionKind::Arrange => {
            let SubmittedValue::Order(given) = value else {
                return Err(mismatch());
            };
            *given == canonical_arrangement(test_cases)
        }
        QuestionKind::Upload => {
            let SubmittedValue::Upload(_) = value else {
                return Err(mismatch());
            };
            return Ok(Check::Verdict(Verdict {
                accepted: true,
                success: false,
                marks: 0.0,
                detail: vec!["Upload stored for manual grading".to_string()],
            }));
        }
        QuestionKind::Code => {
            let SubmittedValue::Code(source) = value else {
                return Err(mismatch());
            };
            return Ok(Check::Dispatch(job_payload(question, test_cases, source)));
        }
    };

    Ok(Check::Verdict(Verdict::graded(question, success)))
}

fn correct_options(test_cases: &[TestCase]) -> BTreeSet<i64> {
    test_cases
        .iter()
        .filter(|tc| matches!(tc.data.0, TestCaseKind::Mcq { correct: true, .. }))
        .map(|tc| tc.id)
        .collect()
}

/// The expected arrangement is the authoring order of the options.
pub fn canonical_arrangement(test_cases: &[TestCase]) -> Vec<i64> {
    let mut ids: Vec<i64> = test_cases
        .iter()
        .filter(|tc| matches!(tc.data.0, TestCaseKind::Arrange { .. }))
        .map(|tc| tc.id)
        .collect();
    ids.sort_unstable();
    ids
}

/// Line-by-line comparison; `Lower` folds case on both sides first.
fn strings_match(expected: &str, given: &str, mode: StringCheck) -> bool {
    match mode {
        StringCheck::Exact => expected.lines().eq(given.lines()),
        StringCheck::Lower => expected.to_lowercase().lines().eq(given.to_lowercase().lines()),
    }
}

fn job_payload(question: &Question, test_cases: &[TestCase], source: &str) -> JobPayload {
    JobPayload {
        question_id: question.id,
        submitted_source: source.to_string(),
        reference_assertions: test_cases
            .iter()
            .map(|tc| tc.data.0.clone())
            .filter(TestCaseKind::is_code_assertion)
            .collect(),
        positional_args: question.run_args.positional.clone(),
        keyword_args: question.run_args.keyword.clone(),
        ref_code_path: question.ref_code_path.clone(),
        partial_grading: question.partial_grading,
    }
}

#![forbid(unsafe_code)]

//! Mode parity harness.
//!
//! Every fixture runs eagerly first; the eager outputs are the expected
//! values the trace-compiled and batched runs are compared against.

use cf_control::{
    CondOptions, ControlFlowError, ExecutionContext, StepFn, WhileOptions, make_cond_with,
    make_while_with,
};
use cf_core::{BatchAxes, CompatibilityMode, Operand, Value, ValueError};
use cf_lax::{Primitive, eval_binary};
use cf_test_utils::{ExecutionKind, TestLogV1, TestResult, fixture_id_from_json};
use cf_transforms::{LoopAndStackMapper, SpecializingCompiler, TransformError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PARITY_SCHEMA_VERSION: &str = "ctrlflow.mode-parity.v1";

/// Step-function pairs the harness knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixtureProgram {
    /// `while x0 < limit`, every operand steps by one.
    CountUp { limit: i64 },
    /// Carry `(i, acc)`: `while i < limit { i += 1; acc += i }`.
    TriangularSum { limit: i64 },
    /// `cond(p, xs..)`: doubled operands when `p` is non-zero, negated otherwise.
    SignBranch,
}

impl FixtureProgram {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CountUp { .. } => "count_up",
            Self::TriangularSum { .. } => "triangular_sum",
            Self::SignBranch => "sign_branch",
        }
    }

    /// Condition and body for loop programs, true and false branch for `SignBranch`.
    #[must_use]
    pub fn step_fns(self) -> (StepFn, StepFn) {
        match self {
            Self::CountUp { limit } | Self::TriangularSum { limit } => {
                let cond = StepFn::pure("below_limit", move |args: &[Value]| {
                    Ok(vec![eval_binary(
                        Primitive::Lt,
                        &args[0],
                        &Value::scalar_i64(limit),
                    )?])
                });
                let body = if matches!(self, Self::CountUp { .. }) {
                    StepFn::pure("step_all", |args: &[Value]| {
                        args.iter()
                            .map(|value| offset(value, 1))
                            .collect::<Result<Vec<_>, _>>()
                    })
                } else {
                    StepFn::pure("accumulate", |args: &[Value]| {
                        let next = offset(&args[0], 1)?;
                        let acc = eval_binary(Primitive::Add, &args[1], &next)?;
                        Ok(vec![next, acc])
                    })
                    .with_arity(2)
                };
                (cond, body)
            }
            Self::SignBranch => {
                let double = StepFn::pure("double", |args: &[Value]| {
                    args.iter()
                        .map(|value| scale(value, 2))
                        .collect::<Result<Vec<_>, _>>()
                });
                let negate = StepFn::pure("negate", |args: &[Value]| {
                    args.iter()
                        .map(|value| scale(value, -1))
                        .collect::<Result<Vec<_>, _>>()
                });
                (double, negate)
            }
        }
    }
}

fn offset(value: &Value, by: i64) -> Result<Value, TransformError> {
    Ok(eval_binary(Primitive::Add, value, &Value::scalar_i64(by))?)
}

fn scale(value: &Value, by: i64) -> Result<Value, TransformError> {
    Ok(eval_binary(Primitive::Mul, value, &Value::scalar_i64(by))?)
}

/// One fixture: a program and its independent lanes.
///
/// `lanes[k]` holds every operand of lane `k`; for `SignBranch` the first
/// entry is the predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureCase {
    pub case_id: String,
    pub program: FixtureProgram,
    pub lanes: Vec<Vec<i64>>,
}

impl FixtureCase {
    #[must_use]
    pub fn new(case_id: impl Into<String>, program: FixtureProgram, lanes: Vec<Vec<i64>>) -> Self {
        Self {
            case_id: case_id.into(),
            program,
            lanes,
        }
    }
}

#[derive(Debug, Clone)]
pub enum HarnessError {
    RaggedLanes { case_id: String },
    ControlFlow(ControlFlowError),
    Value(ValueError),
    UnexpectedOutput { detail: String },
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RaggedLanes { case_id } => {
                write!(f, "fixture {case_id} has no lanes or lanes of differing width")
            }
            Self::ControlFlow(err) => write!(f, "{err}"),
            Self::Value(err) => write!(f, "{err}"),
            Self::UnexpectedOutput { detail } => write!(f, "unexpected output: {detail}"),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ControlFlow(err) => Some(err),
            Self::Value(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ControlFlowError> for HarnessError {
    fn from(err: ControlFlowError) -> Self {
        Self::ControlFlow(err)
    }
}

impl From<ValueError> for HarnessError {
    fn from(err: ValueError) -> Self {
        Self::Value(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: String,
    pub program: String,
    pub execution: ExecutionKind,
    pub matched: bool,
    pub expected_json: String,
    pub actual_json: Option<String>,
    pub error: Option<String>,
}

impl CaseReport {
    /// Structured log record for this case.
    pub fn to_test_log(&self, fixture: &FixtureCase) -> Result<TestLogV1, serde_json::Error> {
        let result = if self.matched {
            TestResult::Pass
        } else {
            TestResult::Fail
        };
        let log = TestLogV1::case(
            format!("{}::{}", self.case_id, self.program),
            fixture_id_from_json(fixture)?,
            self.execution,
            result,
        );
        Ok(match &self.error {
            Some(error) => log.with_details(error.clone()),
            None => log,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityReport {
    pub schema_version: String,
    pub mode: CompatibilityMode,
    pub total_cases: usize,
    pub matched_cases: usize,
    pub mismatched_cases: usize,
    pub reports: Vec<CaseReport>,
}

impl ParityReport {
    #[must_use]
    pub fn all_matched(&self) -> bool {
        self.mismatched_cases == 0
    }
}

/// Per-lane outputs of one execution discipline.
pub type LaneOutputs = Vec<Vec<i64>>;

/// Run every case under every discipline and compare against eager.
#[must_use]
pub fn run_parity(cases: &[FixtureCase], mode: CompatibilityMode) -> ParityReport {
    let reports: Vec<CaseReport> = cases
        .iter()
        .flat_map(|case| run_case(case, mode))
        .collect();
    let matched_cases = reports.iter().filter(|report| report.matched).count();
    ParityReport {
        schema_version: PARITY_SCHEMA_VERSION.to_owned(),
        mode,
        total_cases: reports.len(),
        matched_cases,
        mismatched_cases: reports.len() - matched_cases,
        reports,
    }
}

/// Three reports for `case`: eager, trace and batched.
#[must_use]
pub fn run_case(case: &FixtureCase, mode: CompatibilityMode) -> Vec<CaseReport> {
    let expected = run_mode(case, mode, ExecutionKind::Eager);
    let expected_json = match &expected {
        Ok(lanes) => encode(lanes),
        Err(err) => format!("error: {err}"),
    };

    [ExecutionKind::Eager, ExecutionKind::Trace, ExecutionKind::Batched]
        .into_iter()
        .map(|execution| {
            let actual = if execution == ExecutionKind::Eager {
                expected.clone()
            } else {
                run_mode(case, mode, execution)
            };
            let (matched, actual_json, error) = match (&expected, actual) {
                (Ok(want), Ok(got)) => (*want == got, Some(encode(&got)), None),
                (_, Ok(got)) => (false, Some(encode(&got)), None),
                (_, Err(err)) => (false, None, Some(err.to_string())),
            };
            tracing::debug!(
                case = %case.case_id,
                execution = ?execution,
                matched,
                "parity case finished"
            );
            CaseReport {
                case_id: case.case_id.clone(),
                program: case.program.as_str().to_owned(),
                execution,
                matched,
                expected_json: expected_json.clone(),
                actual_json,
                error,
            }
        })
        .collect()
}

fn encode(lanes: &LaneOutputs) -> String {
    serde_json::to_string(lanes).unwrap_or_default()
}

/// Run `case` under one discipline and collect per-lane outputs.
///
/// Eager and trace runs process lanes one by one; the batched run stacks the
/// lanes along axis 0 and makes a single call.
pub fn run_mode(
    case: &FixtureCase,
    mode: CompatibilityMode,
    execution: ExecutionKind,
) -> Result<LaneOutputs, HarnessError> {
    let width = lane_width(case)?;
    let ctx = context_for(execution);
    let (first, second) = case.program.step_fns();

    let call: Box<dyn Fn(Vec<Operand>) -> Result<Vec<Operand>, ControlFlowError>> =
        match case.program {
            FixtureProgram::SignBranch => {
                let tracer = make_cond_with(first, second, CondOptions::new().with_mode(mode))?;
                Box::new(move |mut operands: Vec<Operand>| {
                    let predicate = operands.remove(0);
                    tracer.cond(&ctx, predicate, operands)
                })
            }
            FixtureProgram::CountUp { .. } | FixtureProgram::TriangularSum { .. } => {
                let tracer = make_while_with(first, second, WhileOptions::new().with_mode(mode))?;
                Box::new(move |operands: Vec<Operand>| tracer.while_loop(&ctx, operands))
            }
        };

    if execution == ExecutionKind::Batched {
        let operands = (0..width)
            .map(|position| -> Result<Operand, HarnessError> {
                let column: Vec<i64> = case.lanes.iter().map(|lane| lane[position]).collect();
                Ok(Operand::batched(
                    Value::vector_i64(&column)?,
                    BatchAxes::single(0),
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let columns = call(operands)?
            .into_iter()
            .map(|operand| tensor_column(&operand.value))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(transpose(&columns, case.lanes.len()));
    }

    case.lanes
        .iter()
        .map(|lane| -> Result<Vec<i64>, HarnessError> {
            let operands = lane
                .iter()
                .map(|value| Operand::plain(Value::scalar_i64(*value)))
                .collect();
            call(operands)?
                .into_iter()
                .map(|operand| {
                    operand
                        .value
                        .as_i64_scalar()
                        .ok_or_else(|| HarnessError::UnexpectedOutput {
                            detail: format!("expected an i64 scalar, got {:?}", operand.value),
                        })
                })
                .collect()
        })
        .collect()
}

fn lane_width(case: &FixtureCase) -> Result<usize, HarnessError> {
    let ragged = || HarnessError::RaggedLanes {
        case_id: case.case_id.clone(),
    };
    let width = case.lanes.first().map(Vec::len).ok_or_else(ragged)?;
    if width == 0 || case.lanes.iter().any(|lane| lane.len() != width) {
        return Err(ragged());
    }
    Ok(width)
}

fn context_for(execution: ExecutionKind) -> ExecutionContext {
    match execution {
        ExecutionKind::Eager => ExecutionContext::eager(),
        ExecutionKind::Trace => ExecutionContext::trace(Arc::new(SpecializingCompiler::new())),
        ExecutionKind::Batched => ExecutionContext::batched(
            Arc::new(SpecializingCompiler::new()),
            Arc::new(LoopAndStackMapper::new()),
        ),
    }
}

fn tensor_column(value: &Value) -> Result<Vec<i64>, HarnessError> {
    value
        .as_tensor()
        .and_then(|tensor| tensor.to_i64_vec())
        .ok_or_else(|| HarnessError::UnexpectedOutput {
            detail: format!("expected an i64 vector, got {value:?}"),
        })
}

fn transpose(columns: &[Vec<i64>], lanes: usize) -> LaneOutputs {
    (0..lanes)
        .map(|lane| columns.iter().map(|column| column[lane]).collect())
        .collect()
}

/// Fixture set covering every supported operand count plus diverging lanes.
#[must_use]
pub fn default_fixture_cases() -> Vec<FixtureCase> {
    let mut cases: Vec<FixtureCase> = (1..=9)
        .map(|arity| {
            FixtureCase::new(
                format!("count_up_arity_{arity}"),
                FixtureProgram::CountUp { limit: 4 },
                vec![
                    (0..arity as i64).collect(),
                    (0..arity as i64).map(|x| x * 3).collect(),
                ],
            )
        })
        .collect();
    cases.push(FixtureCase::new(
        "count_up_diverging",
        FixtureProgram::CountUp { limit: 10 },
        vec![vec![0], vec![5], vec![9]],
    ));
    cases.push(FixtureCase::new(
        "count_up_already_done",
        FixtureProgram::CountUp { limit: 3 },
        vec![vec![7, 1], vec![3, 2]],
    ));
    cases.push(FixtureCase::new(
        "triangular_sum",
        FixtureProgram::TriangularSum { limit: 5 },
        vec![vec![0, 0], vec![2, 10], vec![5, 1]],
    ));
    cases.push(FixtureCase::new(
        "sign_branch_mixed",
        FixtureProgram::SignBranch,
        vec![vec![1, 3, -2], vec![0, 3, -2], vec![7, -4, 0]],
    ));
    cases
}

pub fn emit_parity_json(report: &ParityReport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

#[must_use]
pub fn emit_parity_markdown(report: &ParityReport) -> String {
    let mut out = String::new();
    out.push_str("# Mode Parity Report\n\n");
    out.push_str("| Metric | Value |\n");
    out.push_str("|---|---|\n");
    out.push_str(&format!("| Schema | `{}` |\n", report.schema_version));
    out.push_str(&format!("| Mode | {:?} |\n", report.mode));
    out.push_str(&format!("| Total Cases | {} |\n", report.total_cases));
    out.push_str(&format!("| Matched Cases | {} |\n", report.matched_cases));
    out.push_str(&format!(
        "| Mismatched Cases | {} |\n\n",
        report.mismatched_cases
    ));

    out.push_str("| Case ID | Program | Execution | Matched |\n");
    out.push_str("|---|---|---|---|\n");
    for case in &report.reports {
        out.push_str(&format!(
            "| {} | {} | {:?} | {} |\n",
            case.case_id, case.program, case.execution, case.matched
        ));
    }
    out
}

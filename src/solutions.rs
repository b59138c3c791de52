use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::Digest;
use crate::checker::{CompiledChecker, check, compile_checker};
use crate::code::{DigestOrSource, RunOptions, compile_item, run_item};
use crate::context::JudgeContext;
use crate::environment::{EnvironmentSandbox, ExecutionConfig};
use crate::error::JudgeError;
use crate::package::Solution;
use crate::queue::{EvaluationJob, JobQueue};
use crate::verdict::{Evaluation, Outcome, TestcaseLog, VerificationLevel};
use crate::worker::worker;

/// Compiled programs shared by every evaluation job
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub checker: Option<CompiledChecker>,
    /// Executable digest per solution index; untracked solutions are absent
    pub executables: BTreeMap<usize, Digest>,
}

fn is_tracked(tracked: Option<&HashSet<PathBuf>>, solution: &Solution) -> bool {
    tracked.is_none_or(|set| set.contains(&solution.code.path))
}

/// Compiles every tracked solution, failing on the first compilation error
pub fn compile_solutions(
    ctx: &JudgeContext,
    tracked: Option<&HashSet<PathBuf>>,
) -> Result<BTreeMap<usize, Digest>> {
    let mut compiled = BTreeMap::new();
    for (index, solution) in ctx.package.solutions.iter().enumerate() {
        if !is_tracked(tracked, solution) {
            continue;
        }
        log::info!("Compiling solution {}", solution.code.path.display());
        let digest = compile_item(ctx, &solution.code).with_context(|| {
            format!("failed compiling solution {}", solution.code.path.display())
        })?;
        compiled.insert(index, digest);
    }
    Ok(compiled)
}

/// Limits solutions run with, derived from the package and verification level
pub fn solution_limits(ctx: &JudgeContext) -> ExecutionConfig {
    let time_limit = ctx.verification.effective_time_limit(ctx.package.time_limit);
    ExecutionConfig {
        command: None,
        sandbox: Some(EnvironmentSandbox {
            time_limit: Some(time_limit),
            wall_time_limit: Some(time_limit),
            memory_limit: Some(ctx.package.memory_limit),
            ..Default::default()
        }),
    }
}

/// Runs and checks one solution on one testcase, persisting the evaluation
///
/// Errors are infrastructure failures; every verdict is in the returned
/// [`Evaluation`].
pub fn run_testcase(
    ctx: &JudgeContext,
    plan: &RunPlan,
    job: &EvaluationJob,
) -> Result<Evaluation> {
    let solution = ctx
        .package
        .solutions
        .get(job.solution)
        .ok_or_else(|| anyhow!("solution {} does not exist", job.solution))?;
    let executable = plan
        .executables
        .get(&job.solution)
        .ok_or_else(|| anyhow!("solution {} was not compiled", job.solution))?;

    let log_path =
        evaluation_log_path(&ctx.runs_dir(), job.solution, &job.group_name, job.index);
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir)?;
    }
    let output_path = log_path.with_extension("out");
    let error_path = log_path.with_extension("err");

    let options = RunOptions {
        stdin: Some(job.testcase.input_path.clone().into()),
        stdout: Some(output_path.clone().into()),
        stderr: Some(error_path.into()),
        extra_config: Some(solution_limits(ctx)),
        ..Default::default()
    };
    let run_log = run_item(
        ctx,
        &solution.code,
        &DigestOrSource::Digest(executable.clone()),
        &options,
    )?
    .ok_or_else(|| {
        JudgeError::SandboxInfrastructure(format!(
            "no sandbox for {} on {}/{}",
            solution.code.path.display(),
            job.group_name,
            job.index
        ))
    })?;

    let result = check(ctx, plan.checker.as_ref(), &run_log, &job.testcase, &output_path)?;
    let evaluation = Evaluation {
        result,
        testcase: job.testcase.clone(),
        log: TestcaseLog {
            charged_time_ms: ctx.sandbox_kind().charged_time_ms(&run_log),
            run_log,
            log_absolute_path: Some(log_path.clone()),
        },
    };
    fs::write(&log_path, serde_json::to_string_pretty(&evaluation)?)
        .with_context(|| format!("failed to write {}", log_path.display()))?;
    Ok(evaluation)
}

/// Evaluations of one testcase group, in declared testcase order
#[derive(Debug, Clone)]
pub struct GroupEvaluations {
    pub name: String,
    pub evaluations: Vec<Evaluation>,
}

impl GroupEvaluations {
    fn max_time_ms(&self) -> u64 {
        self.evaluations
            .iter()
            .map(|e| e.log.charged_time_ms)
            .max()
            .unwrap_or(0)
    }
}

/// Aggregated verdicts of one solution
#[derive(Debug, Clone)]
pub struct SolutionReport {
    pub index: usize,
    pub solution: Solution,
    pub runs_dir: PathBuf,
    pub groups: Vec<GroupEvaluations>,
    /// Non-accepted verdicts the declared outcome does not allow
    pub unmatched: BTreeSet<Outcome>,
    pub max_time_ms: u64,
    /// Passed only thanks to the doubled time limit of full verification
    pub slack_warning: bool,
}

impl SolutionReport {
    pub fn new(
        index: usize,
        solution: Solution,
        runs_dir: PathBuf,
        groups: Vec<GroupEvaluations>,
        time_limit_ms: u64,
        verification: VerificationLevel,
    ) -> Self {
        let bad: BTreeSet<Outcome> = groups
            .iter()
            .flat_map(|g| g.evaluations.iter())
            .map(|e| e.result.outcome)
            .filter(|o| *o != Outcome::Accepted)
            .collect();
        let (matched, unmatched): (BTreeSet<Outcome>, BTreeSet<Outcome>) = bad
            .into_iter()
            .partition(|o| solution.outcome.matches(*o));
        let max_time_ms = groups
            .iter()
            .map(GroupEvaluations::max_time_ms)
            .max()
            .unwrap_or(0);

        let only_timeouts = matched.iter().all(|o| *o == Outcome::TimeLimitExceeded);
        let slack_warning = verification >= VerificationLevel::Full
            && only_timeouts
            && max_time_ms > time_limit_ms
            && max_time_ms < time_limit_ms * 2;
        if slack_warning {
            log::warn!(
                "{} still passed in double TL ({max_time_ms} ms > {time_limit_ms} ms)",
                solution.code.path.display()
            );
        }

        Self {
            index,
            solution,
            runs_dir,
            groups,
            unmatched,
            max_time_ms,
            slack_warning,
        }
    }

    pub fn passed(&self) -> bool {
        self.unmatched.is_empty()
    }

    pub fn evaluations(&self) -> impl Iterator<Item = &Evaluation> {
        self.groups.iter().flat_map(|g| g.evaluations.iter())
    }
}

impl fmt::Display for SolutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({})",
            self.solution.code.path.display(),
            self.runs_dir.display()
        )?;
        for group in &self.groups {
            write!(f, "{} ({} ms)", group.name, group.max_time_ms())?;
            for (i, evaluation) in group.evaluations.iter().enumerate() {
                write!(f, " {i}/{}", evaluation.result.outcome.marker())?;
            }
            writeln!(f)?;
        }
        if self.passed() {
            write!(f, "OK Expected: {}", self.solution.outcome)?;
        } else {
            let names: Vec<&str> = self.unmatched.iter().map(Outcome::name).collect();
            write!(
                f,
                "FAILED Expected: {}, got: {}",
                self.solution.outcome,
                names.join(" ")
            )?;
        }
        writeln!(f)?;
        if self.slack_warning {
            writeln!(f, "WARNING The solution still passed in double TL.")?;
        }
        writeln!(f, "Time: {} ms", self.max_time_ms)
    }
}

/// Reports of every evaluated solution, in package order
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub solutions: Vec<SolutionReport>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.solutions.iter().all(SolutionReport::passed)
    }

    /// Groups finished jobs back into declared order
    pub fn assemble(ctx: &JudgeContext, mut done: Vec<(EvaluationJob, Evaluation)>) -> Self {
        done.sort_by_key(|(job, _)| job.order_key());

        let mut per_solution: BTreeMap<usize, Vec<GroupEvaluations>> = BTreeMap::new();
        for (job, evaluation) in done {
            let groups = per_solution.entry(job.solution).or_default();
            match groups.last_mut() {
                Some(group) if group.name == job.group_name => group.evaluations.push(evaluation),
                _ => groups.push(GroupEvaluations {
                    name: job.group_name,
                    evaluations: vec![evaluation],
                }),
            }
        }

        let solutions = per_solution
            .into_iter()
            .filter_map(|(index, groups)| {
                let solution = ctx.package.solutions.get(index)?.clone();
                Some(SolutionReport::new(
                    index,
                    solution,
                    ctx.runs_dir().join(index.to_string()),
                    groups,
                    ctx.package.time_limit,
                    ctx.verification,
                ))
            })
            .collect();
        Self { solutions }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for solution in &self.solutions {
            writeln!(f, "{solution}")?;
        }
        Ok(())
    }
}

/// Jobs for every tracked solution, group and testcase in declared order
pub fn plan_jobs(ctx: &JudgeContext, plan: &RunPlan) -> Result<Vec<EvaluationJob>> {
    let mut jobs = Vec::new();
    for &solution in plan.executables.keys() {
        for (group, testcase_group) in ctx.package.testcases.iter().enumerate() {
            for (index, testcase) in ctx.testcases(testcase_group)?.into_iter().enumerate() {
                jobs.push(EvaluationJob {
                    solution,
                    group,
                    group_name: testcase_group.name.clone(),
                    index,
                    testcase,
                });
            }
        }
    }
    Ok(jobs)
}

/// Compiles the checker and tracked solutions, then evaluates every
/// (solution, testcase) pair on `n_workers` workers
pub async fn run_solutions(
    ctx: Arc<JudgeContext>,
    tracked: Option<HashSet<PathBuf>>,
    n_workers: u32,
    token: CancellationToken,
) -> Result<RunReport> {
    let compile_ctx = Arc::clone(&ctx);
    let plan = tokio::task::spawn_blocking(move || -> Result<RunPlan> {
        let checker = compile_checker(&compile_ctx)?;
        let executables = compile_solutions(&compile_ctx, tracked.as_ref())?;
        Ok(RunPlan {
            checker,
            executables,
        })
    })
    .await??;
    let plan = Arc::new(plan);

    let queue = Arc::new(JobQueue::new());
    let jobs = plan_jobs(&ctx, &plan)?;
    log::info!("Evaluating {} runs on {} workers", jobs.len(), n_workers.max(1));
    for job in jobs {
        queue.push(job).await;
    }

    let mut workers = JoinSet::new();
    for id in 1..=n_workers.max(1) {
        workers.spawn(worker(
            id,
            Arc::clone(&ctx),
            Arc::clone(&plan),
            Arc::clone(&queue),
            token.clone(),
        ));
    }

    let mut done = Vec::new();
    let mut failure = None;
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Ok(pairs)) => done.extend(pairs),
            Ok(Err(e)) => {
                failure.get_or_insert(e);
            }
            Err(e) => {
                token.cancel();
                failure.get_or_insert(anyhow!("worker task failed: {e}"));
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    if token.is_cancelled() {
        return Err(anyhow!("evaluation cancelled"));
    }

    Ok(RunReport::assemble(&ctx, done))
}

/// Path of the persisted log of one evaluation
pub fn evaluation_log_path(runs_dir: &Path, solution: usize, group: &str, index: usize) -> PathBuf {
    runs_dir
        .join(solution.to_string())
        .join(group)
        .join(format!("{index}.log"))
}

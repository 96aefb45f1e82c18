// External model runner
//
// The detection and tracking models live in a separate program. Each call is
// a "job": a JSON description written next to the shared arrays, passed as the
// only argument. The runner writes its outputs to the paths named in the job
// and may print a small JSON answer on stdout.

use anyhow::{bail, Context, Result};
use ndarray::{ArrayD, ArrayViewD};
use ndarray_npy::{read_npy, write_npy, ReadableElement, WritableElement};
use serde::Serialize;
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Scratch files of one job, removed on drop whether the job succeeded or not.
#[derive(Default)]
pub struct ScratchFiles {
    paths: Vec<PathBuf>,
}

impl ScratchFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: PathBuf) -> PathBuf {
        self.paths.push(path.clone());
        path
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub struct ModelRunner {
    program: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
    jobs_run: Cell<usize>,
}

impl ModelRunner {
    pub fn new(program: &Path, work_dir: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            args: Vec::new(),
            work_dir: work_dir.to_path_buf(),
            jobs_run: Cell::new(0),
        }
    }

    /// Arguments placed before the job path, e.g. the script of an interpreter.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn jobs_run(&self) -> usize {
        self.jobs_run.get()
    }

    /// Path of a scratch file belonging to `job`.
    pub fn scratch_path(&self, job: &str, suffix: &str) -> PathBuf {
        self.work_dir.join(format!("{}.{}", job, suffix))
    }

    /// Write an input array as `<name>.npy` in the work directory.
    pub fn write_array<T: WritableElement>(&self, name: &str, data: &ArrayViewD<'_, T>) -> Result<PathBuf> {
        let path = self.scratch_path(name, "npy");
        write_npy(&path, data).with_context(|| format!("Failed to write runner input {:?}", path))?;
        Ok(path)
    }

    pub fn read_output<T: ReadableElement>(&self, path: &Path) -> Result<ArrayD<T>> {
        read_npy(path).with_context(|| format!("Failed to read runner output {:?}", path))
    }

    /// Run one job and return whatever the runner printed on stdout.
    pub fn run<J: Serialize>(&self, job: &str, description: &J) -> Result<String> {
        let mut scratch = ScratchFiles::new();
        let job_path = scratch.track(self.scratch_path(job, "job.json"));
        let file = std::fs::File::create(&job_path)
            .with_context(|| format!("Failed to create job file {:?}", job_path))?;
        serde_json::to_writer_pretty(file, description)?;

        tracing::debug!("Running {:?} {:?}", self.program, job_path);
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&job_path)
            .output()
            .with_context(|| format!("Failed to start model runner {:?}", self.program))?;
        self.jobs_run.set(self.jobs_run.get() + 1);

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!("[runner] {}", line);
        }
        if !output.status.success() {
            bail!(
                "Model runner {:?} failed on job '{}' ({}): {}",
                self.program,
                job,
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

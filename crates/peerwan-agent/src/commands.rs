// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! External tool invocation behind a trait, so route, NAT and apply logic
//! can be exercised in tests without root or a kernel.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
	pub status: i32,
	pub stdout: String,
	pub stderr: String,
}

impl CommandOutput {
	pub fn success(&self) -> bool {
		self.status == 0
	}

	/// Combined stdout+stderr for error messages.
	pub fn combined(&self) -> String {
		let mut text = self.stdout.clone();
		if !self.stderr.is_empty() {
			if !text.is_empty() {
				text.push('\n');
			}
			text.push_str(&self.stderr);
		}
		text
	}
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
	async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput>;

	async fn run_with_stdin(
		&self,
		program: &str,
		args: &[&str],
		stdin: &[u8],
	) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the host, capturing both output streams.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
	async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
		let output = Command::new(program).args(args).output().await?;
		Ok(CommandOutput {
			status: output.status.code().unwrap_or(-1),
			stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
			stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
		})
	}

	async fn run_with_stdin(
		&self,
		program: &str,
		args: &[&str],
		stdin: &[u8],
	) -> std::io::Result<CommandOutput> {
		let mut child = Command::new(program)
			.args(args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()?;
		if let Some(mut pipe) = child.stdin.take() {
			pipe.write_all(stdin).await?;
		}
		let output = child.wait_with_output().await?;
		Ok(CommandOutput {
			status: output.status.code().unwrap_or(-1),
			stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
			stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
		})
	}
}

/// Format a command line for error messages and the journal.
pub fn command_line(program: &str, args: &[&str]) -> String {
	let mut line = program.to_string();
	for arg in args {
		line.push(' ');
		line.push_str(arg);
	}
	line
}


#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn combined_output_joins_streams() {
		let output = CommandOutput {
			status: 1,
			stdout: "out".to_string(),
			stderr: "err".to_string(),
		};
		assert!(!output.success());
		assert_eq!(output.combined(), "out\nerr");
	}

	#[tokio::test]
	async fn system_runner_captures_exit_status() {
		let runner = SystemRunner;
		let ok = runner.run("true", &[]).await.unwrap();
		assert!(ok.success());
		let fail = runner.run("false", &[]).await.unwrap();
		assert!(!fail.success());
	}

	#[tokio::test]
	async fn system_runner_feeds_stdin() {
		let runner = SystemRunner;
		let out = runner.run_with_stdin("cat", &[], b"hello").await.unwrap();
		assert_eq!(out.stdout, "hello");
	}
}

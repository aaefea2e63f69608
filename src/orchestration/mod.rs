//! Orchestration of the external container engine
//!
//! - [`ContainerRuntime`]: image operations on podman or docker
//! - [`LayerBuilder`]: turns one layer spec into one image on its parent

mod builder;
mod factory;
mod native;
mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::{
    classify_failure, layer_labels, BuildFailure, BuildRequest, BuiltImage, ImageBuilder,
    LayerBuilder, LAYER_REPOSITORY,
};
pub use factory::create_runtime;
pub use native::{EngineBinary, NativeRuntime};
pub use runtime::ContainerRuntime;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

/// Max number of output lines to include in build error messages.
const BUILD_ERROR_TAIL_LINES: usize = 50;

/// Extract the useful tail of build output for error diagnostics.
///
/// Combines stdout and stderr, then returns the last `BUILD_ERROR_TAIL_LINES`
/// lines so error messages are actionable without being overwhelming.
pub(crate) fn build_error_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let start = lines.len().saturating_sub(BUILD_ERROR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines for error reporting. Pipes that were
/// not captured are treated as already closed.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> Vec<String> {
    let stderr = child.stderr.take();
    let stdout = child.stdout.take();

    let mut stderr_reader = stderr.map(|s| BufReader::new(s).lines());
    let mut stdout_reader = stdout.map(|s| BufReader::new(s).lines());

    let mut all_output = Vec::new();
    let mut stderr_done = stderr_reader.is_none();
    let mut stdout_done = stdout_reader.is_none();

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = next_line(&mut stderr_reader), if !stderr_done => {
                match line {
                    Some(line) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    None => stderr_done = true,
                }
            }
            line = next_line(&mut stdout_reader), if !stdout_done => {
                match line {
                    Some(line) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    None => stdout_done = true,
                }
            }
        }
    }

    all_output
}

async fn next_line<R: AsyncRead + Unpin>(
    reader: &mut Option<Lines<BufReader<R>>>,
) -> Option<String> {
    reader.as_mut()?.next_line().await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_output_keeps_tail() {
        let stdout: String = (0..80).map(|i| format!("line {i}\n")).collect();
        let tail = build_error_output(&stdout, "E: failed");
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), BUILD_ERROR_TAIL_LINES);
        assert_eq!(*lines.last().unwrap(), "E: failed");
        assert_eq!(lines[0], "line 31");
    }

    #[test]
    fn build_error_output_short() {
        assert_eq!(build_error_output("a\nb", ""), "a\nb");
    }
}

//! UI context: interactive terminal, CI, or machine-readable output

use std::io::IsTerminal;

/// Decides how much decoration the CLI prints
#[derive(Debug, Clone)]
pub struct UiContext {
    /// Spinners, progress bars and cliclack framing
    interactive: bool,
    /// `--yes`: approve prompts without asking
    auto_yes: bool,
    /// Structured output on stdout; decorations are suppressed
    machine: bool,
}

impl UiContext {
    /// Detect the current environment
    pub fn detect() -> Self {
        Self {
            interactive: Self::detect_interactive(),
            auto_yes: false,
            machine: false,
        }
    }

    /// Plain output, no prompts
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            auto_yes: false,
            machine: false,
        }
    }

    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    /// Machine-readable mode: stdout carries only the JSON document
    pub fn with_machine_output(mut self, machine: bool) -> Self {
        self.machine = machine;
        if machine {
            self.interactive = false;
        }
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    pub fn is_machine(&self) -> bool {
        self.machine
    }

    /// Spinners and colors
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }

    fn detect_interactive() -> bool {
        if !std::io::stdout().is_terminal() || !std::io::stdin().is_terminal() {
            return false;
        }

        const CI_VARS: &[&str] = &[
            "CI",
            "GITHUB_ACTIONS",
            "GITLAB_CI",
            "CIRCLECI",
            "JENKINS_URL",
            "BUILDKITE",
            "TF_BUILD",
        ];
        !CI_VARS.iter().any(|var| std::env::var_os(var).is_some())
    }
}

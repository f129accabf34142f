//! Engine configuration and iteration ceilings.

use std::time::Duration;

/// Knobs governing a pipeline run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stage-local quality gate retries per stage.
    pub max_stage_retries: u32,
    /// Pipeline-level rework rounds (backward cursor jumps) per run.
    pub max_rework_rounds: u32,
    /// Tool rounds per stage invocation.
    pub max_tool_rounds: u32,
    /// Collision (challenge/revise) rounds unless a dispatch plan overrides.
    pub collision_rounds: u32,
    /// Upper bound on dispatch-requested collision rounds.
    pub max_collision_rounds: u32,
    /// Deadline for each executed command.
    pub command_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_stage_retries: 2,
            max_rework_rounds: 3,
            max_tool_rounds: 6,
            collision_rounds: 1,
            max_collision_rounds: 3,
            command_deadline: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_stage_retries(mut self, retries: u32) -> Self {
        self.max_stage_retries = retries;
        self
    }

    pub fn with_max_rework_rounds(mut self, rounds: u32) -> Self {
        self.max_rework_rounds = rounds;
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    pub fn with_collision_rounds(mut self, rounds: u32) -> Self {
        self.collision_rounds = rounds.min(self.max_collision_rounds);
        self
    }

    pub fn with_max_collision_rounds(mut self, rounds: u32) -> Self {
        self.max_collision_rounds = rounds;
        self.collision_rounds = self.collision_rounds.min(rounds);
        self
    }

    pub fn with_command_deadline(mut self, deadline: Duration) -> Self {
        self.command_deadline = deadline.max(Duration::from_secs(1));
        self
    }

    /// Hard bound on state-machine iterations for a workflow of
    /// `stage_count` stages. Every legal retry/rework combination fits under
    /// it; exceeding it means an unforeseen cycle.
    pub fn iteration_ceiling(&self, stage_count: usize) -> u32 {
        let stages = stage_count as u32;
        stages * (self.max_stage_retries + 1) * (self.max_rework_rounds + 1) + stages
    }
}

//! Configurable denylist filter for job commands. Effective against
//! accidental self-inflicted damage (e.g. an operator-typo'd `rm -rf /`),
//! not a sandbox against hostile input.

#[derive(Debug, Clone)]
pub struct CommandFilter {
    denylist: Vec<String>,
}

impl Default for CommandFilter {
    fn default() -> Self {
        Self {
            denylist: vec![
                "rm -rf /".to_string(),
                ":(){ :|:& };:".to_string(),
                "mkfs".to_string(),
                "dd if=/dev/zero".to_string(),
            ],
        }
    }
}

impl CommandFilter {
    pub fn new(denylist: Vec<String>) -> Self {
        Self { denylist }
    }

    /// `Err(reason)` if `command` matches a denylisted substring.
    pub fn check(&self, command: &str) -> Result<(), String> {
        for pattern in &self.denylist {
            if command.contains(pattern.as_str()) {
                return Err(format!("matched denylisted pattern {pattern:?}"));
            }
        }
        Ok(())
    }
}

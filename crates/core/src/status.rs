//! Status snapshot serializer. Rendered as space-separated `key=value` pairs
//! on one line (`pid`, `size`, `is_mirroring`, `has_control`,
//! `migration_pass`), and wired to a control command that actually emits
//! it. `migration_pass` is always present (`0` when idle) so a consumer
//! can rely on every field being there rather than conditionally parsing
//! one of them.

#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub pid: u32,
    pub size: u64,
    pub is_mirroring: bool,
    pub has_control: bool,
    pub migration_pass: usize,
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

impl Status {
    pub fn render(&self) -> String {
        format!(
            "pid={} size={} is_mirroring={} has_control={} migration_pass={}\n",
            self.pid,
            self.size,
            bool_str(self.is_mirroring),
            bool_str(self.has_control),
            self.migration_pass,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_status_renders_migration_pass_zero() {
        let status = Status {
            pid: 42,
            size: 1024,
            is_mirroring: false,
            has_control: true,
            migration_pass: 0,
        };
        assert_eq!(
            status.render(),
            "pid=42 size=1024 is_mirroring=false has_control=true migration_pass=0\n"
        );
    }

    #[test]
    fn mirroring_status_includes_migration_pass() {
        let status = Status {
            pid: 42,
            size: 1024,
            is_mirroring: true,
            has_control: true,
            migration_pass: 3,
        };
        assert_eq!(
            status.render(),
            "pid=42 size=1024 is_mirroring=true has_control=true migration_pass=3\n"
        );
    }
}

/// Logical backend domains served through the bridge.
///
/// Each domain owns one fixed, durable request queue shared by all of
/// its clients and workers. Clients publish to the queue; workers
/// consume from it as competing consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Credits,
    Review,
    Statistics,
    UserManagement,
    XlsxParsing,
}

impl Domain {
    /// All domains, in a stable order. Handy for startup loops that
    /// build one client or worker per domain.
    pub const ALL: [Domain; 5] = [
        Domain::Credits,
        Domain::Review,
        Domain::Statistics,
        Domain::UserManagement,
        Domain::XlsxParsing,
    ];

    /// Name of the domain's durable request queue.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Domain::Credits => "credits_queue",
            Domain::Review => "review_queue",
            Domain::Statistics => "statistics_queue",
            Domain::UserManagement => "user_management_queue",
            Domain::XlsxParsing => "xlsx_parsing_queue",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.queue_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_are_fixed() {
        let names: Vec<_> = Domain::ALL.iter().map(Domain::queue_name).collect();
        assert_eq!(
            names,
            vec![
                "credits_queue",
                "review_queue",
                "statistics_queue",
                "user_management_queue",
                "xlsx_parsing_queue",
            ]
        );
    }
}

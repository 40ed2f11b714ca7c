pub const REGIONS_IN_TRANSITION: &str = "region_assigner_regions_in_transition";
pub const REGIONS_IN_TRANSITION_OVER_THRESHOLD: &str =
    "region_assigner_regions_in_transition_over_threshold";
pub const OLDEST_REGION_IN_TRANSITION_MS: &str = "region_assigner_oldest_region_in_transition_ms";

pub const ASSIGN_ATTEMPTS: &str = "region_assigner_assign_attempts";
pub const OPEN_RPC_FAILURES: &str = "region_assigner_open_rpc_failures";
pub const CLOSE_RPC_FAILURES: &str = "region_assigner_close_rpc_failures";
pub const BULK_ASSIGN_REGIONS: &str = "region_assigner_bulk_assign_regions";
pub const TRANSITION_EVENTS: &str = "region_assigner_transition_events";
pub const MALFORMED_TRANSITIONS: &str = "region_assigner_malformed_transitions";
pub const TIMEOUTS_ACTED_ON: &str = "region_assigner_timeouts_acted_on";
pub const SERVER_SHUTDOWNS: &str = "region_assigner_server_shutdowns";

pub const JANITOR_RUN_STARTS: &str = "region_assigner_janitor_run_starts";
pub const JANITOR_RUN_TIME: &str = "region_assigner_janitor_total_run_ms";
pub const JANITOR_PARENTS_CLEANED: &str = "region_assigner_janitor_parents_cleaned";

pub const BALANCER_MOVES: &str = "region_assigner_balancer_moves";

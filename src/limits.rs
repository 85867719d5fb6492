/// Longest item display name accepted at provisioning.
pub const MAX_ITEM_NAME_LEN: usize = 255;

/// Longest value accepted for any guest contact field.
pub const MAX_CONTACT_FIELD_LEN: usize = 255;

/// Shortest accepted first name.
pub const MIN_FIRST_NAME_LEN: usize = 3;

/// Widest booking, in days.
pub const MAX_BOOKING_DAYS: i64 = 366;

/// Upper bound on restrictions held for a single item.
pub const MAX_RESTRICTIONS_PER_ITEM: usize = 100_000;

/// Upper bound on catalog size in the local store.
pub const MAX_ITEMS: usize = 10_000;

/// Upper bound on add/keep directives in one calendar submission.
pub const MAX_CALENDAR_DIRECTIVES: usize = 10_000;

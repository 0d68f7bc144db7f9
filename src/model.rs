use std::fmt;

use chrono::{Datelike, FixedOffset, NaiveDate, NaiveTime, TimeZone, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type in the crate.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict overlap: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Staff,
    Admin,
}

impl Role {
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Staff | Role::Admin)
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Role::Client),
            "staff" => Ok(Role::Staff),
            "admin" => Ok(Role::Admin),
            _ => Err(()),
        }
    }
}

/// The caller, as supplied by the identity provider. Passed explicitly on
/// every call that needs authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn client(id: Ulid) -> Self {
        Self { id, role: Role::Client }
    }

    pub fn staff(id: Ulid) -> Self {
        Self { id, role: Role::Staff }
    }

    pub fn admin(id: Ulid) -> Self {
        Self { id, role: Role::Admin }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.role, self.id)
    }
}

// ── Resources ────────────────────────────────────────────────────

/// Daily working-hours template, in the studio's local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub step_minutes: u32,
    #[serde(default)]
    pub closed_days: Vec<Weekday>,
}

impl WorkingHours {
    pub fn works_on(&self, date: NaiveDate) -> bool {
        !self.closed_days.contains(&date.weekday())
    }

    /// The working window for `date`, or `None` on a closed day.
    /// Overnight templates (`close <= open`) have no window.
    pub fn window(&self, date: NaiveDate, offset: FixedOffset) -> Option<Span> {
        if !self.works_on(date) {
            return None;
        }
        let start = local_ms(date, self.open, offset)?;
        let end = local_ms(date, self.close, offset)?;
        (start < end).then(|| Span::new(start, end))
    }
}

/// Convert a local date + time of day at a fixed offset into an instant.
pub fn local_ms(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Option<Ms> {
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.timestamp_millis())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    pub hours: WorkingHours,
}

// ── Holds ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub owner_id: Ulid,
    /// Client-supplied idempotency key.
    pub token: String,
    pub created_at: Ms,
    pub expires_at: Ms,
}

impl Hold {
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Draft,
    Held,
    Confirmed,
    Ongoing,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 6] = [
        BookingStatus::Draft,
        BookingStatus::Held,
        BookingStatus::Confirmed,
        BookingStatus::Ongoing,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
    ];

    /// The transition table. Every status change goes through here.
    pub fn allowed_next(self) -> &'static [BookingStatus] {
        use BookingStatus::*;
        match self {
            Draft => &[Held, Cancelled],
            Held => &[Confirmed, Cancelled],
            Confirmed => &[Ongoing, Cancelled],
            Ongoing => &[Completed, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Statuses that occupy the resource's calendar.
    pub fn is_live(self) -> bool {
        matches!(self, BookingStatus::Held | BookingStatus::Confirmed | BookingStatus::Ongoing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Draft => "draft",
            BookingStatus::Held => "held",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Ongoing => "ongoing",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub client_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    /// Minor currency units; opaque to the engine.
    pub price: Option<i64>,
    pub paid_amount: i64,
    pub project_id: Option<Ulid>,
    pub label: Option<String>,
    pub reschedule_count: u32,
    pub last_rescheduled_at: Option<Ms>,
    pub cancelled_by: Option<Ulid>,
    pub cancel_reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

// ── Sessions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Planned,
    Ongoing,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn allowed_next(self) -> &'static [SessionStatus] {
        use SessionStatus::*;
        match self {
            Planned => &[Ongoing, Cancelled],
            Ongoing => &[Completed, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Planned | SessionStatus::Ongoing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Planned => "planned",
            SessionStatus::Ongoing => "ongoing",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A working appointment, optionally tied to a booking or project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub booking_id: Option<Ulid>,
    pub project_id: Option<Ulid>,
    pub span: Span,
    pub status: SessionStatus,
    pub reschedule_count: u32,
    pub last_rescheduled_at: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Session {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

// ── Calendar occupants ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccupantKind {
    Hold,
    Booking,
    Session,
}

/// A live occupant of a resource's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Busy {
    pub id: Ulid,
    pub kind: OccupantKind,
    pub span: Span,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeSlot {
    pub start: Ms,
    pub end: Ms,
    pub local_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateOption {
    pub date: NaiveDate,
    pub start: Ms,
    pub end: Ms,
}

/// The WAL record format. Saves are full upserts so compaction can rewrite
/// current state as one record per entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceSaved(Resource),
    HoldSaved(Hold),
    HoldDeleted { id: Ulid, resource_id: Ulid },
    HoldCommitted { hold_id: Ulid, booking: Booking },
    BookingSaved(Booking),
    SessionSaved(Session),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_overlap_single_ms() {
        assert!(Span::new(100, 201).overlaps(&Span::new(200, 300)));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer)); // self-containment
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(BookingStatus::Completed.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
        for s in BookingStatus::ALL {
            if !s.is_terminal() {
                assert!(s.can_transition_to(BookingStatus::Cancelled), "{s} must be cancellable");
            }
        }
    }

    #[test]
    fn happy_path_is_linear() {
        use BookingStatus::*;
        let path = [Draft, Held, Confirmed, Ongoing, Completed];
        for w in path.windows(2) {
            assert!(w[0].can_transition_to(w[1]));
            assert!(!w[1].can_transition_to(w[0]));
        }
        assert!(!Draft.can_transition_to(Confirmed));
    }

    #[test]
    fn live_statuses() {
        use BookingStatus::*;
        let live: Vec<_> = BookingStatus::ALL.into_iter().filter(|s| s.is_live()).collect();
        assert_eq!(live, vec![Held, Confirmed, Ongoing]);
        assert!(SessionStatus::Planned.is_live());
        assert!(!SessionStatus::Completed.is_live());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&BookingStatus::Confirmed).unwrap();
        assert_eq!(json, "\"confirmed\"");
        let back: BookingStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, BookingStatus::Cancelled);
    }

    #[test]
    fn working_window_at_offset() {
        let hours = WorkingHours {
            open: hm(9, 0),
            close: hm(18, 0),
            step_minutes: 30,
            closed_days: vec![Weekday::Sun],
        };
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        // 2030-01-07 is a Monday.
        let monday = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let w = hours.window(monday, offset).unwrap();
        let utc_nine = chrono::Utc
            .with_ymd_and_hms(2030, 1, 7, 7, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(w.start, utc_nine);
        assert_eq!(w.duration_ms(), 9 * 60 * MINUTE_MS);

        let sunday = NaiveDate::from_ymd_opt(2030, 1, 6).unwrap();
        assert!(hours.window(sunday, offset).is_none());
    }

    #[test]
    fn overnight_template_has_no_window() {
        let hours = WorkingHours {
            open: hm(22, 0),
            close: hm(2, 0),
            step_minutes: 30,
            closed_days: vec![],
        };
        let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        assert!(hours.window(date, FixedOffset::east_opt(0).unwrap()).is_none());
    }

    #[test]
    fn role_parsing() {
        assert_eq!("staff".parse::<Role>(), Ok(Role::Staff));
        assert!("root".parse::<Role>().is_err());
        assert!(Role::Admin.is_staff());
        assert!(!Role::Client.is_staff());
    }
}

pub struct Icons;

impl Icons {
    pub const STORE: &str = "🗄️";
    pub const SAVED: &str = "✅";
    pub const FAILED: &str = "❌";
    pub const CAUTION: &str = "⚠️";
    pub const KEY: &str = "🔑";
    pub const PREVIOUS: &str = "⬅️";
    pub const NEXT: &str = "➡️";
    pub const LAST: &str = "⏭️";
    pub const LINK: &str = "🔗";
    pub const DELETED: &str = "🗑️";
}

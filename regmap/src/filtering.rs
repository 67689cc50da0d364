//! Selection of the bit-fields visited by bulk scans

use lazy_static::lazy_static;
use regex::Regex;

use crate::model::{coerce_to_table_zero, BitFieldRecord, RegisterRecord};

lazy_static! {
    /// Internal test and factory-calibration fields, never reported by scans
    static ref INTERNAL_FIELD: Regex = Regex::new(r"^(tb_|fsc_)").unwrap();
}

/// Decides which bit-fields take part in a scan such as
/// [`crate::RegisterMapAccessor::non_default_fields`]
///
/// Fields are only ever visited if their write access is one of the user-writable levels. On
/// top of that, the filter restricts by name and by the table of the owning register.
#[derive(Clone, Debug)]
pub struct FieldFilter {
    /// Filter based on bit-field name
    name: ItemFilter<String>,
    /// Filter based on the (coerced) table of the owning register
    table: ItemFilter<u8>,
}

impl Default for FieldFilter {
    fn default() -> Self {
        Self {
            name: ItemFilter::regex(None, Some(INTERNAL_FIELD.clone())),
            table: ItemFilter::list(None),
        }
    }
}

impl FieldFilter {
    /// All user-writable fields except internal ones
    pub fn all() -> Self {
        Self::default()
    }

    /// Only visit fields whose register lives in one of `tables`
    #[must_use]
    pub fn tables(mut self, tables: impl IntoIterator<Item = u8>) -> Self {
        self.table = ItemFilter::list(Some(tables.into_iter().collect()));
        self
    }

    /// Only visit fields whose name matches `allow`. Internal fields stay excluded.
    #[must_use]
    pub fn names(mut self, allow: Regex) -> Self {
        self.name = ItemFilter::regex(Some(allow), Some(INTERNAL_FIELD.clone()));
        self
    }

    pub fn is_allowed(&self, field: &BitFieldRecord, register: &RegisterRecord) -> bool {
        field.is_user_writable()
            && self.name.is_allowed(&field.name)
            && self.table.is_allowed(&coerce_to_table_zero(register.table))
    }
}

/// What items of type `T` are allowed or not
#[derive(Clone, Debug)]
pub(crate) enum ItemFilter<T: PartialEq> {
    List {
        // If set, only the specified items are allowed. If not set, all items are allowed.
        allow_list: Option<Vec<T>>,
    },
    Regex {
        // If set, only items matching the regex are allowed
        allow: Option<Regex>,
        // If set, items matching the regex are not allowed
        block: Option<Regex>,
    },
}

impl<T: PartialEq + ToString> ItemFilter<T> {
    pub(crate) const fn list(allow_list: Option<Vec<T>>) -> Self {
        Self::List { allow_list }
    }

    pub(crate) const fn regex(allow: Option<Regex>, block: Option<Regex>) -> Self {
        Self::Regex { allow, block }
    }

    pub(crate) fn is_allowed(&self, value: &T) -> bool {
        match self {
            Self::List { allow_list } => allow_list.as_ref().map_or(true, |al| al.contains(value)),
            Self::Regex { allow, block } => {
                let value = value.to_string();
                // Items matched by block regex are always blocked
                if block.as_ref().is_some_and(|block| block.is_match(&value)) {
                    return false;
                }
                allow.as_ref().map_or(true, |allow| allow.is_match(&value))
            }
        }
    }
}

#[test]
fn internal_fields_are_blocked() {
    use crate::model::{Table, WriteAccess};

    let reg = RegisterRecord::new("GAIN", 0x50, Table::Index(1), 0x21);
    let field = |name: &str| BitFieldRecord::new(name, "GAIN", 0, 1).with_write_access(WriteAccess::All);

    let filter = FieldFilter::all();
    assert!(filter.is_allowed(&field("gain"), &reg));
    assert!(!filter.is_allowed(&field("tb_override"), &reg));
    assert!(!filter.is_allowed(&field("fsc_trim"), &reg));
    // Prefix only
    assert!(filter.is_allowed(&field("gain_tb_"), &reg));
    // Not user-writable
    assert!(!filter.is_allowed(&BitFieldRecord::new("ro", "GAIN", 0, 1), &reg));
}

#[test]
fn table_filter_uses_coerced_table() {
    use crate::model::{Table, WriteAccess};

    let field = BitFieldRecord::new("f", "R", 0, 1).with_write_access(WriteAccess::Pw2);
    let bank1 = RegisterRecord::new("R", 0x50, Table::Index(1), 0);
    let loose = RegisterRecord::new("R", 0x50, Table::Unselectable, 0);

    let filter = FieldFilter::all().tables([0]);
    assert!(!filter.is_allowed(&field, &bank1));
    assert!(filter.is_allowed(&field, &loose));

    let filter = FieldFilter::all().tables([1, 2]);
    assert!(filter.is_allowed(&field, &bank1));
}

#[test]
fn name_filter_keeps_internal_block() {
    use crate::model::{Table, WriteAccess};

    let reg = RegisterRecord::new("R", 0x50, Table::Index(0), 0);
    let field = |name: &str| BitFieldRecord::new(name, "R", 0, 1).with_write_access(WriteAccess::Cond);
    let filter = FieldFilter::all().names(Regex::new("^(tb_)?gain").unwrap());
    assert!(filter.is_allowed(&field("gain_lo"), &reg));
    assert!(!filter.is_allowed(&field("mode"), &reg));
    assert!(!filter.is_allowed(&field("tb_gain"), &reg));
}

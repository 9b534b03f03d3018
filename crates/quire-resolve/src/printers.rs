use std::collections::HashMap;

/// Printer and class names known to the surrounding service.
pub trait PrinterDirectory {
    /// Look up a printer or class by name, case-insensitively.
    fn find(&self, name: &str) -> Option<PrinterEntry>;
}

/// A printer, or a class when `members` is not empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterEntry {
    pub name: String,
    pub members: Vec<String>,
}

impl PrinterEntry {
    pub fn printer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn class(name: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }

    /// Names whose files may describe this entry, in lookup order.
    pub fn candidates(&self) -> Vec<&str> {
        if self.members.is_empty() {
            vec![self.name.as_str()]
        } else {
            self.members.iter().map(String::as_str).collect()
        }
    }
}

/// Directory without any printers.
pub struct NoPrinters;

impl PrinterDirectory for NoPrinters {
    fn find(&self, _name: &str) -> Option<PrinterEntry> {
        None
    }
}

/// Fixed in-memory directory.
#[derive(Default)]
pub struct StaticPrinters {
    entries: HashMap<String, PrinterEntry>,
}

impl StaticPrinters {
    pub fn insert(&mut self, entry: PrinterEntry) {
        self.entries.insert(entry.name.to_ascii_lowercase(), entry);
    }
}

impl PrinterDirectory for StaticPrinters {
    fn find(&self, name: &str) -> Option<PrinterEntry> {
        self.entries.get(&name.to_ascii_lowercase()).cloned()
    }
}

//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailstore.
//
// Mailstore is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailstore is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Mailstore. If not, see <http://www.gnu.org/licenses/>.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Tracks text that should be included at the start of every log statement
/// made on behalf of one folder.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    account: String,
    folder: String,
    operation: Option<&'static str>,
}

impl LogPrefix {
    /// Create a prefix for the folder with the given `"<account>/<folder>"`
    /// identifier.
    pub fn new(folder_id: &str) -> Self {
        let (account, folder) = match folder_id.split_once('/') {
            Some((account, folder)) => (account, folder),
            None => ("?", folder_id),
        };

        Self {
            inner: Rc::new(RefCell::new(Inner {
                account: sanitise(account.to_owned()),
                folder: sanitise(folder.to_owned()),
                operation: None,
            })),
        }
    }

    /// Set or clear the label of the exclusive operation currently running.
    pub fn set_operation(&self, operation: Option<&'static str>) {
        self.inner.borrow_mut().operation = operation;
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        write!(f, "mailstore[{}/{}", inner.account, inner.folder)?;
        if let Some(operation) = inner.operation {
            write!(f, " op={operation}")?;
        }
        write!(f, "]")
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

//! Todo list on top of the change API
//!
//! A todo list lives in one document: an ordered list `todos` whose elements
//! are references to todo objects, each with a `title` and a `completed`
//! field. Mutations are plain functions over a [`ChangeBuilder`], so they
//! can be handed straight to `DocumentRegistry::propose`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::convergent::{ChangeBuilder, DocumentState, ObjectId, Value};

/// Document holding the shared todo list
pub const TODO_DOC: &str = "todos";

/// List of todo references within [`TODO_DOC`]
pub const TODO_LIST: &str = "todos";

pub const TITLE: &str = "title";
pub const COMPLETED: &str = "completed";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: ObjectId,
    pub title: String,
    pub completed: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TodoFilter {
    #[default]
    All,
    Active,
    Completed,
}

impl TodoFilter {
    pub fn matches(&self, todo: &Todo) -> bool {
        match self {
            TodoFilter::All => true,
            TodoFilter::Active => !todo.completed,
            TodoFilter::Completed => todo.completed,
        }
    }
}

impl FromStr for TodoFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(TodoFilter::All),
            "active" => Ok(TodoFilter::Active),
            "completed" => Ok(TodoFilter::Completed),
            other => Err(format!("unknown filter '{}'", other)),
        }
    }
}

impl fmt::Display for Todo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.completed { "x" } else { " " };
        write!(f, "[{}] {}", mark, self.title)
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

fn insert(tx: &mut ChangeBuilder<'_>, id: ObjectId, title: &str, completed: bool) {
    tx.set(id.clone(), TITLE, Value::string(title))
        .set(id.clone(), COMPLETED, Value::Bool(completed));
    tx.push(TODO_LIST, Value::Ref(id));
}

/// Append a new, not yet completed todo. Returns its id.
pub fn add_todo(tx: &mut ChangeBuilder<'_>, title: &str) -> ObjectId {
    let id = Uuid::new_v4().to_string();
    insert(tx, id.clone(), title, false);
    id
}

/// Flip a todo's completed flag. Returns false if there is no such todo.
pub fn toggle(tx: &mut ChangeBuilder<'_>, id: &str) -> bool {
    let Some(todo) = find(tx.state(), id) else {
        return false;
    };
    tx.set(id, COMPLETED, Value::Bool(!todo.completed));
    true
}

/// Mark every todo completed (or not)
pub fn toggle_all(tx: &mut ChangeBuilder<'_>, checked: bool) {
    for todo in todos(tx.state()) {
        tx.set(todo.id, COMPLETED, Value::Bool(checked));
    }
}

pub fn edit(tx: &mut ChangeBuilder<'_>, id: &str, title: &str) -> bool {
    if find(tx.state(), id).is_none() {
        return false;
    }
    tx.set(id, TITLE, Value::string(title));
    true
}

/// Remove a todo from the list and tombstone it.
pub fn destroy(tx: &mut ChangeBuilder<'_>, id: &str) -> bool {
    let state = tx.state();
    let elem = state
        .list(TODO_LIST)
        .and_then(|list| list.find(&Value::Ref(id.to_string())))
        .cloned();
    let Some(elem) = elem else {
        return false;
    };
    tx.remove(TODO_LIST, elem).delete(id);
    true
}

/// Destroy every completed todo. Returns how many were removed.
pub fn clear_completed(tx: &mut ChangeBuilder<'_>) -> usize {
    let done: Vec<Todo> = todos(tx.state())
        .into_iter()
        .filter(|t| t.completed)
        .collect();
    done.iter().filter(|t| destroy(tx, &t.id)).count()
}

/// Populate the list with existing todos, keeping their ids.
pub fn seed(tx: &mut ChangeBuilder<'_>, seed: &[Todo]) {
    for todo in seed {
        insert(tx, todo.id.clone(), &todo.title, todo.completed);
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

fn read(state: &DocumentState, id: &ObjectId) -> Option<Todo> {
    let object = state.object(id)?;
    Some(Todo {
        id: id.clone(),
        title: object
            .get(TITLE)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        completed: object.get(COMPLETED).and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Every live todo, in list order
pub fn todos(state: &DocumentState) -> Vec<Todo> {
    state
        .list(TODO_LIST)
        .map(|list| {
            list.values()
                .filter_map(Value::as_ref_id)
                .filter_map(|id| read(state, id))
                .collect()
        })
        .unwrap_or_default()
}

pub fn find(state: &DocumentState, id: &str) -> Option<Todo> {
    todos(state).into_iter().find(|t| t.id == id)
}

pub fn filtered(state: &DocumentState, filter: TodoFilter) -> Vec<Todo> {
    todos(state)
        .into_iter()
        .filter(|t| filter.matches(t))
        .collect()
}

pub fn active_count(state: &DocumentState) -> usize {
    filtered(state, TodoFilter::Active).len()
}

pub fn completed_count(state: &DocumentState) -> usize {
    filtered(state, TodoFilter::Completed).len()
}

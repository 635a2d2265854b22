//! Tool routing
//!
//! Pure functions over a view of the connected applications. No locks and
//! no I/O: the [`Registry`](crate::registry::Registry) calls into this module
//! while it holds its read lock.
//!
//! A tool can be addressed three ways:
//! - bare: `Reset`, only while exactly one connected app declares it
//! - namespaced: `App:Reset`, only while exactly one connected app with that
//!   name declares it
//! - qualified: `App#7:Reset`, always unique (7 is the connection number)
//!
//! The catalog shows each tool under the shortest of these that is unique.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::connection::ConnectionId;
use crate::error::RouteError;
use crate::protocol::ToolDefinition;

/// Borrowed view of one connected application's catalog
#[derive(Debug, Clone, Copy)]
pub struct AppTools<'a> {
    pub connection_id: ConnectionId,
    pub app_name: &'a str,
    pub tools: &'a [ToolDefinition],
}

/// Where an invocation should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub connection_id: ConnectionId,
    pub app_name: String,
    /// Name the owning application knows the tool by
    pub tool_name: String,
}

/// One tool as exposed to the agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    /// Name the agent sees and calls
    pub exposed_name: String,
    pub connection_id: ConnectionId,
    pub app_name: String,
    pub tool: ToolDefinition,
}

impl CatalogEntry {
    /// `{name, description, inputSchema}` under the exposed name
    pub fn to_listing(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.exposed_name.clone(),
            description: self.tool.description.clone(),
            input_schema: self.tool.input_schema.clone(),
        }
    }
}

pub fn namespaced_name(app_name: &str, tool_name: &str) -> String {
    format!("{app_name}:{tool_name}")
}

pub fn qualified_name(app_name: &str, connection_id: ConnectionId, tool_name: &str) -> String {
    format!("{app_name}#{}:{tool_name}", connection_id.as_u64())
}

fn matches_namespaced(name: &str, app_name: &str, tool_name: &str) -> bool {
    name.strip_prefix(app_name)
        .and_then(|rest| rest.strip_prefix(':'))
        .is_some_and(|rest| rest == tool_name)
}

fn matches_qualified(name: &str, app: &AppTools<'_>, tool_name: &str) -> bool {
    let Some(rest) = name
        .strip_prefix(app.app_name)
        .and_then(|rest| rest.strip_prefix('#'))
    else {
        return false;
    };
    let Some((number, tool)) = rest.split_once(':') else {
        return false;
    };
    tool == tool_name && number.parse::<u64>().ok() == Some(app.connection_id.as_u64())
}

/// Occurrence counts used to pick exposed names
struct NameCounts<'a> {
    bare: HashMap<&'a str, usize>,
    namespaced: HashMap<(&'a str, &'a str), usize>,
    /// Every namespaced and qualified form in the view; a shorter name equal
    /// to one of these would resolve to that entry instead
    longer_forms: HashSet<String>,
    qualified_forms: HashSet<String>,
}

impl<'a> NameCounts<'a> {
    fn new(apps: &[AppTools<'a>]) -> Self {
        let mut bare = HashMap::new();
        let mut namespaced = HashMap::new();
        let mut longer_forms = HashSet::new();
        let mut qualified_forms = HashSet::new();
        for app in apps {
            for tool in app.tools {
                *bare.entry(tool.name.as_str()).or_insert(0) += 1;
                *namespaced
                    .entry((app.app_name, tool.name.as_str()))
                    .or_insert(0) += 1;
                let qualified = qualified_name(app.app_name, app.connection_id, &tool.name);
                longer_forms.insert(namespaced_name(app.app_name, &tool.name));
                longer_forms.insert(qualified.clone());
                qualified_forms.insert(qualified);
            }
        }
        Self {
            bare,
            namespaced,
            longer_forms,
            qualified_forms,
        }
    }

    fn exposed_name(&self, app: &AppTools<'a>, tool_name: &'a str) -> String {
        if self.bare.get(tool_name).copied().unwrap_or(0) == 1
            && !self.longer_forms.contains(tool_name)
        {
            return tool_name.to_string();
        }
        self.namespaced_or_qualified(app, tool_name)
    }

    fn namespaced_or_qualified(&self, app: &AppTools<'a>, tool_name: &'a str) -> String {
        let namespaced = namespaced_name(app.app_name, tool_name);
        if self
            .namespaced
            .get(&(app.app_name, tool_name))
            .copied()
            .unwrap_or(0)
            == 1
            && !self.qualified_forms.contains(&namespaced)
        {
            namespaced
        } else {
            qualified_name(app.app_name, app.connection_id, tool_name)
        }
    }
}

/// Flatten the catalogs of all given apps, in the given order
pub fn aggregate(apps: &[AppTools<'_>]) -> Vec<CatalogEntry> {
    let counts = NameCounts::new(apps);
    apps.iter()
        .flat_map(|app| {
            let counts = &counts;
            app.tools.iter().map(move |tool| CatalogEntry {
                exposed_name: counts.exposed_name(app, &tool.name),
                connection_id: app.connection_id,
                app_name: app.app_name.to_string(),
                tool: tool.clone(),
            })
        })
        .collect()
}

/// Resolve a (possibly namespaced) tool name to exactly one owner
///
/// Qualified and namespaced forms are tried before the bare form. A name
/// matching more than one owner is never routed; the error lists names that
/// would be unique.
pub fn resolve(name: &str, apps: &[AppTools<'_>]) -> Result<Route, RouteError> {
    for app in apps {
        if let Some(tool) = app.tools.iter().find(|t| matches_qualified(name, app, &t.name)) {
            return Ok(route(app, tool));
        }
    }

    let namespaced: Vec<(&AppTools<'_>, &ToolDefinition)> = apps
        .iter()
        .flat_map(|app| app.tools.iter().map(move |tool| (app, tool)))
        .filter(|(app, tool)| matches_namespaced(name, app.app_name, &tool.name))
        .collect();
    match namespaced.as_slice() {
        [(app, tool)] => return Ok(route(app, tool)),
        [] => {}
        many => {
            return Err(RouteError::Ambiguous {
                name: name.to_string(),
                candidates: many
                    .iter()
                    .map(|(app, tool)| qualified_name(app.app_name, app.connection_id, &tool.name))
                    .collect(),
            })
        }
    }

    let bare: Vec<(&AppTools<'_>, &ToolDefinition)> = apps
        .iter()
        .flat_map(|app| app.tools.iter().map(move |tool| (app, tool)))
        .filter(|(_, tool)| tool.name == name)
        .collect();
    match bare.as_slice() {
        [(app, tool)] => Ok(route(app, tool)),
        [] => Err(RouteError::NotFound(name.to_string())),
        many => {
            let counts = NameCounts::new(apps);
            Err(RouteError::Ambiguous {
                name: name.to_string(),
                candidates: many
                    .iter()
                    .map(|(app, tool)| counts.namespaced_or_qualified(app, &tool.name))
                    .collect(),
            })
        }
    }
}

fn route(app: &AppTools<'_>, tool: &ToolDefinition) -> Route {
    Route {
        connection_id: app.connection_id,
        app_name: app.app_name.to_string(),
        tool_name: tool.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools(names: &[&str]) -> Vec<ToolDefinition> {
        names.iter().map(|n| ToolDefinition::new(*n, "")).collect()
    }

    #[test]
    fn test_unique_bare_name_routes() {
        let foo = tools(&["Ping", "Click"]);
        let conn = ConnectionId::next();
        let apps = [AppTools {
            connection_id: conn,
            app_name: "Foo",
            tools: &foo,
        }];

        let route = resolve("Ping", &apps).unwrap();
        assert_eq!(route.connection_id, conn);
        assert_eq!(route.tool_name, "Ping");

        let route = resolve("Foo:Click", &apps).unwrap();
        assert_eq!(route.tool_name, "Click");

        assert_eq!(
            resolve("Missing", &apps),
            Err(RouteError::NotFound("Missing".to_string()))
        );
        assert!(resolve("Bar:Ping", &apps).is_err());
    }

    #[test]
    fn test_bare_collision_is_ambiguous() {
        let a_tools = tools(&["Reset", "OnlyA"]);
        let b_tools = tools(&["Reset"]);
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        let apps = [
            AppTools {
                connection_id: a,
                app_name: "A",
                tools: &a_tools,
            },
            AppTools {
                connection_id: b,
                app_name: "B",
                tools: &b_tools,
            },
        ];

        let err = resolve("Reset", &apps).unwrap_err();
        assert_eq!(
            err,
            RouteError::Ambiguous {
                name: "Reset".to_string(),
                candidates: vec!["A:Reset".to_string(), "B:Reset".to_string()],
            }
        );

        assert_eq!(resolve("A:Reset", &apps).unwrap().connection_id, a);
        assert_eq!(resolve("B:Reset", &apps).unwrap().connection_id, b);
        assert_eq!(resolve("OnlyA", &apps).unwrap().connection_id, a);
    }

    #[test]
    fn test_same_app_name_on_two_connections() {
        let first_tools = tools(&["Reset"]);
        let second_tools = tools(&["Reset"]);
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        let apps = [
            AppTools {
                connection_id: first,
                app_name: "A",
                tools: &first_tools,
            },
            AppTools {
                connection_id: second,
                app_name: "A",
                tools: &second_tools,
            },
        ];

        assert!(matches!(
            resolve("A:Reset", &apps),
            Err(RouteError::Ambiguous { .. })
        ));

        let qualified = qualified_name("A", second, "Reset");
        assert_eq!(resolve(&qualified, &apps).unwrap().connection_id, second);

        let catalog = aggregate(&apps);
        assert_eq!(catalog[0].exposed_name, qualified_name("A", first, "Reset"));
        assert_eq!(catalog[1].exposed_name, qualified);
    }

    #[test]
    fn test_aggregate_namespaces_only_collisions() {
        let a_tools = tools(&["Reset", "Ping"]);
        let b_tools = tools(&["Reset"]);
        let apps = [
            AppTools {
                connection_id: ConnectionId::next(),
                app_name: "A",
                tools: &a_tools,
            },
            AppTools {
                connection_id: ConnectionId::next(),
                app_name: "B",
                tools: &b_tools,
            },
        ];

        let names: Vec<String> = aggregate(&apps)
            .into_iter()
            .map(|entry| entry.exposed_name)
            .collect();
        assert_eq!(names, vec!["A:Reset", "Ping", "B:Reset"]);
    }

    #[test]
    fn test_every_exposed_name_resolves_back() {
        let a_tools = tools(&["Reset", "Ping"]);
        let b_tools = tools(&["Reset", "Zoom"]);
        let c_tools = tools(&["Reset"]);
        let x_tools = tools(&["A:Reset"]);
        let apps = [
            AppTools {
                connection_id: ConnectionId::next(),
                app_name: "A",
                tools: &a_tools,
            },
            AppTools {
                connection_id: ConnectionId::next(),
                app_name: "B",
                tools: &b_tools,
            },
            AppTools {
                connection_id: ConnectionId::next(),
                app_name: "B",
                tools: &c_tools,
            },
            AppTools {
                connection_id: ConnectionId::next(),
                app_name: "X",
                tools: &x_tools,
            },
        ];

        for entry in aggregate(&apps) {
            let route = resolve(&entry.exposed_name, &apps).unwrap();
            assert_eq!(route.connection_id, entry.connection_id);
            assert_eq!(route.tool_name, entry.tool.name);
        }
    }

    #[test]
    fn test_separator_in_bare_name_does_not_shadow() {
        let a_tools = tools(&["Reset"]);
        let x_tools = tools(&["A:Reset"]);
        let a = ConnectionId::next();
        let x = ConnectionId::next();
        let apps = [
            AppTools {
                connection_id: a,
                app_name: "A",
                tools: &a_tools,
            },
            AppTools {
                connection_id: x,
                app_name: "X",
                tools: &x_tools,
            },
        ];

        let catalog = aggregate(&apps);
        assert_eq!(catalog[0].exposed_name, "Reset");
        assert_eq!(catalog[1].exposed_name, "X:A:Reset");

        for entry in &catalog {
            let route = resolve(&entry.exposed_name, &apps).unwrap();
            assert_eq!(route.connection_id, entry.connection_id);
            assert_eq!(route.tool_name, entry.tool.name);
        }
        assert_eq!(resolve("A:Reset", &apps).unwrap().connection_id, a);
    }

    #[test]
    fn test_hash_in_app_name_does_not_shadow_qualified_form() {
        let a_tools = tools(&["Reset"]);
        let b_tools = tools(&["Reset"]);
        let odd_tools = tools(&["Reset"]);
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        let odd_name = format!("A#{}", a.as_u64());
        let apps = [
            AppTools {
                connection_id: a,
                app_name: "A",
                tools: &a_tools,
            },
            AppTools {
                connection_id: b,
                app_name: "A",
                tools: &b_tools,
            },
            AppTools {
                connection_id: ConnectionId::next(),
                app_name: &odd_name,
                tools: &odd_tools,
            },
        ];

        let catalog = aggregate(&apps);
        for entry in &catalog {
            let route = resolve(&entry.exposed_name, &apps).unwrap();
            assert_eq!(route.connection_id, entry.connection_id, "{}", entry.exposed_name);
        }
    }

    #[test]
    fn test_listing_uses_exposed_name() {
        let entry = CatalogEntry {
            exposed_name: "Foo:Ping".to_string(),
            connection_id: ConnectionId::next(),
            app_name: "Foo".to_string(),
            tool: ToolDefinition::new("Ping", "pong")
                .with_input_schema(serde_json::json!({"type": "object", "required": ["x"]})),
        };
        let listing = entry.to_listing();
        assert_eq!(listing.name, "Foo:Ping");
        assert_eq!(listing.description, "pong");
        assert_eq!(listing.input_schema["required"][0], "x");
    }
}

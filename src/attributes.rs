// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Attribute merging.
//!
//! The final attribute set of a node is assembled from six sources. Later
//! sources win over earlier ones, recursively for nested objects:
//!
//! 1. cookbook defaults of every recipe,
//! 2. environment default attributes,
//! 3. role default attributes,
//! 4. normal attributes of the node itself,
//! 5. role override attributes,
//! 6. environment override attributes.

use crate::{
    expand::Expansion,
    kitchen::{Catalog, Environment, Node},
};

use serde_json::{Map, Value};

/// Top-level node keys that are never treated as normal attributes.
pub const RESERVED_KEYS: [&str; 7] = [
    "id",
    "name",
    "role",
    "roles",
    "recipes",
    "run_list",
    "ipaddress",
];

/// Deep merge `overlay` into `base`.
///
/// Objects present on both sides are merged recursively. Any other value in
/// `overlay` replaces whatever `base` holds.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(inner)), Value::Object(overlay)) => deep_merge(inner, overlay),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Insert value at `/` delimited compound key, building nested objects.
///
/// `"a/b/c"` with value `1` yields `{"a": {"b": {"c": 1}}}`. Intermediate
/// scalars standing in the way are replaced by objects.
pub fn insert_compound(base: &mut Map<String, Value>, key: &str, value: Value) {
    let mut parts = key.split('/').peekable();
    let mut cursor = base;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            cursor.insert(part.into(), value);
            return;
        }

        let slot = cursor
            .entry(part)
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        cursor = match slot {
            Value::Object(map) => map,
            _ => unreachable!("slot was just turned into an object"),
        };
    }
}

/// Merge every attribute source into node.
///
/// # Errors
///
/// - Return [`AttributeError::MissingRecipe`] if a recipe of the expansion is
///   not in the catalog.
pub fn merge_node_attributes(
    node: &mut Node,
    expansion: &Expansion,
    catalog: &Catalog,
    environment: &Environment,
) -> Result<()> {
    let mut attributes = Map::new();

    for name in &expansion.recipes {
        let recipe = catalog
            .recipe(name)
            .ok_or_else(|| AttributeError::MissingRecipe {
                recipe: name.clone(),
                node: node.name().into(),
            })?;
        for (key, value) in &recipe.attributes {
            insert_compound(&mut attributes, key, value.clone());
        }
    }

    deep_merge(&mut attributes, &environment.default_attributes);

    let roles = expansion
        .roles
        .iter()
        .filter_map(|name| catalog.role(name))
        .collect::<Vec<_>>();
    for role in &roles {
        deep_merge(&mut attributes, &role.default_attributes);
    }

    let normal = node
        .as_map()
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<Map<_, _>>();
    deep_merge(&mut attributes, &normal);

    for role in &roles {
        deep_merge(&mut attributes, &role.override_attributes);
    }

    deep_merge(&mut attributes, &environment.override_attributes);

    node.as_map_mut().extend(attributes);

    Ok(())
}

/// All possible error types for attribute merging.
#[derive(Debug, thiserror::Error)]
pub enum AttributeError {
    /// Node expands to a recipe that no cookbook provides.
    #[error("could not find recipe {recipe:?} while building node data bag for {node:?}")]
    MissingRecipe { recipe: String, node: String },
}

/// Friendly result alias :3
pub type Result<T, E = AttributeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kitchen::{Recipe, Role};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn deep_merge_recurses_into_objects() {
        let mut base = object(json!({"a": {"x": 1, "y": 2}, "b": 1, "c": {"z": 0}}));
        let overlay = object(json!({"a": {"y": 3, "w": 4}, "b": {"n": 1}, "c": 5}));

        deep_merge(&mut base, &overlay);
        assert_eq!(
            Value::Object(base),
            json!({"a": {"x": 1, "y": 3, "w": 4}, "b": {"n": 1}, "c": 5})
        );
    }

    #[test]
    fn insert_compound_builds_nested_objects() {
        let mut base = object(json!({"apache": "flat"}));
        insert_compound(&mut base, "apache/listen/port", json!(80));
        insert_compound(&mut base, "apache/listen/ssl", json!(false));
        insert_compound(&mut base, "timezone", json!("UTC"));

        assert_eq!(
            Value::Object(base),
            json!({"apache": {"listen": {"port": 80, "ssl": false}}, "timezone": "UTC"})
        );
    }

    fn fixture(levels: [&str; 6]) -> (Node, Expansion, Catalog, Environment) {
        let recipe = Recipe {
            name: "app".into(),
            attributes: BTreeMap::from([("app/level".to_string(), json!(levels[0]))]),
            ..Default::default()
        };
        let role = Role {
            fullname: "app".into(),
            name: "app".into(),
            default_attributes: object(json!({"app": {"level": levels[2]}})),
            override_attributes: object(json!({"app": {"level": levels[4]}})),
            ..Default::default()
        };
        let environment = Environment {
            name: "production".into(),
            default_attributes: object(json!({"app": {"level": levels[1]}})),
            override_attributes: object(json!({"app": {"level": levels[5]}})),
            ..Default::default()
        };
        let node = Node::from_map(
            "n1",
            object(json!({"chef_environment": "production", "app": {"level": levels[3]}})),
        );
        let expansion = Expansion {
            role: vec!["app".into()],
            roles: vec!["app".into()],
            recipes: vec!["app".into()],
        };

        (node, expansion, Catalog::new([recipe], [role]), environment)
    }

    fn merged_level(levels: [&str; 6]) -> Value {
        let (mut node, expansion, catalog, environment) = fixture(levels);
        merge_node_attributes(&mut node, &expansion, &catalog, &environment).unwrap();
        node.get("app").cloned().unwrap_or_default()
    }

    #[test]
    fn environment_override_has_final_word() {
        let levels = ["cookbook", "env_default", "role_default", "normal", "role_override", "env_override"];
        assert_eq!(merged_level(levels), json!({"level": "env_override"}));

        let mut changed = levels;
        changed[5] = "other";
        assert_eq!(merged_level(changed), json!({"level": "other"}));

        let mut changed = levels;
        changed[0] = "other";
        assert_eq!(merged_level(changed), json!({"level": "env_override"}));
    }

    #[test]
    fn reserved_keys_are_not_normal_attributes() {
        let (mut node, expansion, catalog, environment) =
            fixture(["a", "b", "c", "d", "e", "f"]);
        node.set_ipaddress("10.0.0.1");
        let before = node.as_map().get("run_list").cloned();

        merge_node_attributes(&mut node, &expansion, &catalog, &environment).unwrap();
        assert_eq!(node.as_map().get("run_list").cloned(), before);
        assert_eq!(node.ipaddress(), Some("10.0.0.1"));
        assert_eq!(node.chef_environment(), "production");
    }

    #[test]
    fn missing_recipe_names_recipe_and_node() {
        let (mut node, mut expansion, catalog, environment) =
            fixture(["a", "b", "c", "d", "e", "f"]);
        expansion.recipes.push("ghost::recipe".into());

        let error = merge_node_attributes(&mut node, &expansion, &catalog, &environment).unwrap_err();
        assert_eq!(
            error.to_string(),
            r#"could not find recipe "ghost::recipe" while building node data bag for "n1""#
        );
    }
}

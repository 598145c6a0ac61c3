//! Queue naming.

use crate::config::RuntimeEnv;

/// PascalCase an application name: `"my_app"`, `"my-app"` and `"my app"` all
/// become `"MyApp"`; already-cased words keep their inner capitals.
pub fn pascalize(name: &str) -> String {
    name.split(|c: char| c == '_' || c == '-' || c == ' ' || c == '.')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Logical name of the default queue for `app_name`.
pub fn default_queue_name(app_name: &str) -> String {
    format!("{}BackgroundJobQueue", pascalize(app_name))
}

/// Broker name for the queue with logical `name`.
///
/// Braces are stripped; on a cluster the whole name is hash-tagged so every
/// key of the queue hashes to one slot. Otherwise, in a parallel test run,
/// the test pool id is appended (see [`parallel_test_safe_queue_name`]).
pub fn wire_name(name: &str, cluster: bool, env: &RuntimeEnv) -> String {
    let bare: String = name.chars().filter(|c| *c != '{' && *c != '}').collect();
    if cluster {
        format!("{{{}}}", bare)
    } else {
        parallel_test_safe_queue_name(&bare, env)
    }
}

/// Suffix `name` with `-{pool id}` in test runs whose pool id is above 1, so
/// parallel test processes never share a queue.
pub fn parallel_test_safe_queue_name(name: &str, env: &RuntimeEnv) -> String {
    match env.test_pool_id {
        Some(pool) if env.is_test && pool > 1 => format!("{}-{}", name, pool),
        _ => name.to_string(),
    }
}

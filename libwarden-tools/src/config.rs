use std::io;
use std::str::FromStr;

/// Configuration, backed by a TOML document.
///
/// Keys are accessed by path: if the requested key contains dots, the
/// path is split and each component looked up recursively.
pub struct Config {
    value: toml::Value,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            value: toml::Value::Table(toml::map::Map::new()),
        }
    }
}

impl Config {
    fn get_value<T: AsRef<str>>(&self, k: T) -> Option<&toml::Value> {
        let mut item = &self.value;
        for key in k.as_ref().split('.') {
            item = item.get(key)?;
        }
        Some(item)
    }
    /// Get an entry of type string by path
    pub fn get<T: AsRef<str>>(&self, k: T) -> Option<&str> {
        let item = self.get_value(k)?;
        item.as_str()
    }
    /// Get an entry of type integer by path
    pub fn get_usize<T: AsRef<str>>(&self, k: T) -> Option<usize> {
        let item = self.get_value(k)?;
        item.as_integer()
            .and_then(|i| if i >= 0 { Some(i as usize) } else { None })
    }
    /// Get an entry of type boolean by path
    pub fn get_bool<T: AsRef<str>>(&self, k: T) -> Option<bool> {
        let item = self.get_value(k)?;
        item.as_bool()
    }
    /// Set an entry by path. Intermediate path elements must already exist
    pub fn set<T, V>(&mut self, k: T, v: V) -> Option<()>
    where
        T: AsRef<str>,
        toml::value::Value: std::convert::From<V>,
    {
        let mut item = &mut self.value;
        let path: Vec<_> = k.as_ref().split('.').collect();
        if path.len() > 1 {
            for key in path.iter().take(path.len() - 1) {
                item = item.get_mut(key)?;
            }
        }
        if let Some(t) = item.as_table_mut() {
            if let Some(p) = path.last() {
                t.insert((*p).to_string(), toml::Value::from(v));
                return Some(());
            }
        }
        None
    }

    /// Load configuration from input object. If keys are already present, they are overwritten
    pub fn load_config<R: io::Read>(&mut self, mut config: R) -> Result<(), io::Error> {
        let mut s = String::new();
        config.read_to_string(&mut s)?;
        match toml::Value::from_str(&s) {
            Ok(value) => {
                self.value = value;
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "Load configuration failed",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    #[test]
    fn config_set_get() {
        let mut config = Config::default();
        assert!(config.set("key1", "value1").is_some());
        assert_eq!(config.get("key1"), Some("value1"));
    }
    #[test]
    fn config_load() {
        let mut config = Config::default();
        let doc = "output_dir = \"/tmp/reports\"\nlog_packets = true\n";
        config
            .load_config(doc.as_bytes())
            .expect("load configuration");
        assert_eq!(config.get("output_dir"), Some("/tmp/reports"));
        assert_eq!(config.get_bool("log_packets"), Some(true));
    }
}

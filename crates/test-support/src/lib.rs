pub mod binder;
pub mod transport;

pub use binder::{BinderEvent, RecordingBinder};
pub use transport::{ScriptedServer, ScriptedTransport};

pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use xmpp_parsers::minidom::Element;

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    /// Raw XML of a stanza fixture.
    pub fn stanza_xml(name: &str) -> String {
        read_or_panic(Path::new("stanzas").join(name))
    }

    /// A stanza fixture parsed into an element.
    pub fn stanza(name: &str) -> Element {
        stanza_xml(name)
            .trim()
            .parse()
            .unwrap_or_else(|error| panic!("fixture stanzas/{name} is not valid XML: {error}"))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

use anyhow::{bail, Result};

/// A generated test: schema statements replayed once per testee, then the statement under test
pub trait StatementSource {
    fn ddl(&self) -> Vec<String>;
    fn dml(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TestCase {
    pub ddl: Vec<String>,
    pub dml: String,
}

impl TestCase {
    /// One statement per line. Blank lines and `--` comments are skipped, the last statement
    /// is the DML and everything before it is DDL.
    pub fn parse(text: &str) -> Result<Self> {
        let mut statements: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("--"))
            .map(String::from)
            .collect();

        let dml = match statements.pop() {
            Some(dml) => dml,
            None => bail!("Test case contains no statements"),
        };

        Ok(Self {
            ddl: statements,
            dml,
        })
    }

    /// Back to the textual form `parse` accepts
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for statement in self.ddl.iter().chain(std::iter::once(&self.dml)) {
            text.push_str(statement);
            text.push('\n');
        }
        text
    }
}

impl StatementSource for TestCase {
    fn ddl(&self) -> Vec<String> {
        self.ddl.clone()
    }

    fn dml(&self) -> String {
        self.dml.clone()
    }
}

#[test]
fn test_parse() {
    let case = TestCase::parse(
        "-- schema\n\
         CREATE TABLE t (a INT);\n\
         \n\
         INSERT INTO t VALUES (1);\n\
         SELECT * FROM t WHERE a > 0;\n",
    )
    .expect("failed to parse test case");

    assert_eq!(
        case.ddl,
        vec!["CREATE TABLE t (a INT);", "INSERT INTO t VALUES (1);"]
    );
    assert_eq!(case.dml, "SELECT * FROM t WHERE a > 0;");
    assert_eq!(TestCase::parse(&case.to_text()).unwrap(), case);
}

#[test]
fn test_parse_dml_only_and_empty() {
    let case = TestCase::parse("SELECT 1").unwrap();
    assert!(case.ddl.is_empty());
    assert_eq!(case.dml, "SELECT 1");

    assert!(TestCase::parse("").is_err());
    assert!(TestCase::parse("-- nothing here\n\n").is_err());
}

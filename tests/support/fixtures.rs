use std::path::{Path, PathBuf};

use rusqlite::Connection;

pub const STORAGE_MOD: &str = r#"
[mod]
name = "storage"
title = "Storage checks"
children = ["benchmark.buckets"]

[[benchmark]]
name = "buckets"
title = "Bucket hygiene"
children = ["control.public_access", "control.versioning", "control.broken"]

[[control]]
name = "public_access"
title = "Buckets are private"
severity = "high"
tags = { service = "s3", cis = "true" }
sql = """
select name as resource,
  case when public = 1 then 'alarm' else 'ok' end as status,
  name || case when public = 1 then ' is public' else ' is private' end as reason,
  region
from buckets
order by name
"""

[[control]]
name = "versioning"
title = "Bucket versioning is enabled"
severity = "low"
tags = { service = "s3" }
query = "versioning_status"
args = [1]

[[control]]
name = "broken"
tags = { service = "ec2" }
sql = "select name as resource from buckets"

[[query]]
name = "versioning_status"
sql = """
select name as resource,
  case when versioning = ?1 then 'ok' else 'alarm' end as status,
  'versioning ' || versioning as reason
from buckets
order by name
"""
"#;

/// Write the bucket table the storage mod queries.
pub fn write_bucket_db(path: &Path) {
    let conn = Connection::open(path).expect("open fixture db");
    conn.execute_batch(
        "CREATE TABLE buckets (name TEXT, region TEXT, public INTEGER, versioning INTEGER);
         INSERT INTO buckets VALUES ('logs', 'us-east-1', 0, 1);
         INSERT INTO buckets VALUES ('site', 'eu-west-1', 1, 0);
         INSERT INTO buckets VALUES ('backup', 'us-east-1', 0, 0);",
    )
    .expect("seed fixture db");
}

/// Write the storage mod into `dir` and return the directory.
pub fn write_storage_mod(dir: &Path) -> PathBuf {
    std::fs::create_dir_all(dir).expect("create mod dir");
    std::fs::write(dir.join("storage.toml"), STORAGE_MOD).expect("write mod file");
    dir.to_path_buf()
}

pub const SCHEMA_VERSION: i64 = 2;

pub const SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Files: one row per discovered remote file and its processing lifecycle
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    remote_id TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL,
    file_path TEXT NOT NULL,
    file_size INTEGER,
    mime_type TEXT,
    created_date TEXT,
    modified_date TEXT,
    width INTEGER,
    height INTEGER,

    processing_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (processing_status IN ('pending', 'in_progress', 'completed', 'failed')),
    processed_at TEXT,
    error_message TEXT,

    -- Lease held while a worker owns the file (status = in_progress)
    leased_at TEXT,
    lease_token TEXT,
    failed_attempts INTEGER NOT NULL DEFAULT 0,

    discovered_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_files_status ON files(processing_status);
CREATE INDEX IF NOT EXISTS idx_files_path ON files(file_path);
CREATE INDEX IF NOT EXISTS idx_files_leased_at ON files(leased_at);

-- Metadata: AI-extracted description, at most one row per file
CREATE TABLE IF NOT EXISTS metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL UNIQUE REFERENCES files(id) ON DELETE CASCADE,
    primary_subject TEXT NOT NULL,
    visual_quality INTEGER NOT NULL CHECK (visual_quality BETWEEN 1 AND 5),
    has_people INTEGER,
    people_count TEXT CHECK (people_count IN ('none', '1-2', '3-5', '6-10', '10+')),
    is_indoor INTEGER,
    social_media_score INTEGER NOT NULL CHECK (social_media_score BETWEEN 1 AND 5),
    social_media_reason TEXT NOT NULL,
    marketing_score INTEGER NOT NULL CHECK (marketing_score BETWEEN 1 AND 5),
    marketing_use TEXT NOT NULL,
    season TEXT CHECK (season IN ('spring', 'summer', 'fall', 'winter', 'unclear')),
    time_of_day TEXT CHECK (time_of_day IN ('morning', 'midday', 'evening', 'unclear')),
    mood_energy TEXT,
    color_palette TEXT,
    notes TEXT,
    extracted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_metadata_quality ON metadata(visual_quality);
CREATE INDEX IF NOT EXISTS idx_metadata_social ON metadata(social_media_score);
CREATE INDEX IF NOT EXISTS idx_metadata_marketing ON metadata(marketing_score);
CREATE INDEX IF NOT EXISTS idx_metadata_people ON metadata(has_people, people_count);

-- Activity tags: closed vocabulary, unique per file
CREATE TABLE IF NOT EXISTS activity_tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    tag_name TEXT NOT NULL CHECK (tag_name IN (
        'gardening', 'harvesting', 'education', 'construction',
        'maintenance', 'cooking', 'celebration', 'children',
        'animals', 'landscape', 'tools', 'produce'
    )),
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(file_id, tag_name)
);

CREATE INDEX IF NOT EXISTS idx_tags_name ON activity_tags(tag_name);

-- Processing attempts: append-only audit log
CREATE TABLE IF NOT EXISTS processing_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    source TEXT NOT NULL CHECK (source IN ('analysis', 'user_edit')),
    outcome TEXT NOT NULL CHECK (outcome IN ('success', 'failure')),
    lease_token TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    error_kind TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_attempts_file_id ON processing_attempts(file_id);

-- Earlier metadata versions, archived on reprocessing or user edit
CREATE TABLE IF NOT EXISTS metadata_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    source TEXT NOT NULL CHECK (source IN ('reprocess', 'user_edit')),
    snapshot TEXT NOT NULL,  -- JSON of the replaced metadata, tags included
    archived_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_file_id ON metadata_history(file_id);

CREATE TRIGGER IF NOT EXISTS update_files_timestamp
AFTER UPDATE ON files
BEGIN
    UPDATE files SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
END;

-- Attempts are never rewritten
CREATE TRIGGER IF NOT EXISTS processing_attempts_append_only
BEFORE UPDATE ON processing_attempts
BEGIN
    SELECT RAISE(ABORT, 'processing_attempts is append-only');
END;
"#;

/// Additive migrations, applied in order to databases created by older
/// versions. Each entry is `(version it produces, statements)`.
pub const MIGRATIONS: &[(i64, &str)] = &[(
    2,
    r#"
    ALTER TABLE files ADD COLUMN failed_attempts INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE metadata ADD COLUMN notes TEXT;
    "#,
)];

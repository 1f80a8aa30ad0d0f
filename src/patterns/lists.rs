//! Curated domain and keyword tables used by the format checks.

/// Disposable mailbox providers. Subdomains match as well.
pub const DISPOSABLE_DOMAINS: &[&str] = &[
    "10minutemail.com",
    "1secmail.com",
    "burnermail.io",
    "byom.de",
    "discard.email",
    "dispostable.com",
    "dropmail.me",
    "emailondeck.com",
    "fakeinbox.com",
    "getnada.com",
    "grr.la",
    "guerrillamail.com",
    "guerrillamail.net",
    "guerrillamail.org",
    "inboxkitten.com",
    "mail.tm",
    "mailcatch.com",
    "maildrop.cc",
    "mailinator.com",
    "mailnesia.com",
    "mailpoof.com",
    "mintemail.com",
    "moakt.com",
    "mohmal.com",
    "mytemp.email",
    "sharklasers.com",
    "spam4.me",
    "spambox.us",
    "spamgourmet.com",
    "tempail.com",
    "tempinbox.com",
    "tempmail.com",
    "temp-mail.org",
    "tempr.email",
    "throwawaymail.com",
    "tmpmail.org",
    "trashmail.com",
    "trbvm.com",
    "wegwerfmail.de",
    "yopmail.com",
];

/// Misspelled provider domains and their corrections.
pub const TYPO_DOMAINS: &[(&str, &str)] = &[
    ("gmial.com", "gmail.com"),
    ("gmai.com", "gmail.com"),
    ("gamil.com", "gmail.com"),
    ("gmal.com", "gmail.com"),
    ("gmaill.com", "gmail.com"),
    ("gnail.com", "gmail.com"),
    ("gmail.co", "gmail.com"),
    ("gmail.cm", "gmail.com"),
    ("gmail.con", "gmail.com"),
    ("gmail.om", "gmail.com"),
    ("hotmial.com", "hotmail.com"),
    ("hotmal.com", "hotmail.com"),
    ("hotmai.com", "hotmail.com"),
    ("hotmaill.com", "hotmail.com"),
    ("hotmail.co", "hotmail.com"),
    ("hotmail.con", "hotmail.com"),
    ("yahooo.com", "yahoo.com"),
    ("yaho.com", "yahoo.com"),
    ("yhoo.com", "yahoo.com"),
    ("yahoo.con", "yahoo.com"),
    ("outlok.com", "outlook.com"),
    ("outloo.com", "outlook.com"),
    ("outlook.co", "outlook.com"),
    ("outlook.con", "outlook.com"),
    ("iclod.com", "icloud.com"),
    ("icoud.com", "icloud.com"),
    ("icloud.co", "icloud.com"),
    ("aoll.com", "aol.com"),
    ("aol.co", "aol.com"),
    ("protonmial.com", "protonmail.com"),
];

/// Domains that only ever appear in documentation or form filler.
pub const PLACEHOLDER_DOMAINS: &[&str] = &[
    "example.com",
    "example.org",
    "example.net",
    "test.com",
    "domain.com",
    "yourdomain.com",
    "sample.com",
    "localhost.localdomain",
];

/// Local parts typed by people who do not want to give an address.
pub const PLACEHOLDER_LOCALS: &[&str] = &[
    "test",
    "noemail",
    "no.email",
    "no-email",
    "none",
    "null",
    "nil",
    "dummy",
    "placeholder",
    "yourname",
    "your.name",
    "youremail",
    "firstname.lastname",
    "john.doe",
    "jane.doe",
];

/// Shared mailboxes rather than people.
pub const ROLE_ACCOUNTS: &[&str] = &[
    "abuse",
    "accounts",
    "admin",
    "administrator",
    "billing",
    "careers",
    "contact",
    "enquiries",
    "feedback",
    "hello",
    "help",
    "hostmaster",
    "hr",
    "info",
    "inquiries",
    "jobs",
    "marketing",
    "media",
    "newsletter",
    "no-reply",
    "noreply",
    "office",
    "postmaster",
    "press",
    "sales",
    "security",
    "service",
    "support",
    "team",
    "webmaster",
];

/// Tokens typical of throwaway or abusive sign-ups.
pub const SPAM_KEYWORDS: &[&str] = &[
    "spam", "junk", "fake", "scam", "viagra", "casino", "lottery", "winner", "prize", "free",
    "cash", "loan", "crypto", "bitcoin", "porn", "xxx", "sex", "bonus", "cheap", "deal",
];

/// Character sequences that indicate keyboard mashing.
pub const SEQUENCES: &[&str] = &[
    "abcdefghijklmnopqrstuvwxyz",
    "0123456789",
    "9876543210",
    "qwertyuiop",
    "asdfghjkl",
    "zxcvbnm",
];

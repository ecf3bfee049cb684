mod attributes;
mod layout;
